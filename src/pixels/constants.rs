use uuid::Uuid;

/**
 * The UUID of the Bluetooth BLE service for Pixels dice.
 */
pub const PIXELS_SERVICE: Uuid = Uuid::from_u128(0xa6b90001_7a5a_43f2_a962_350c8edc9b5b);

/**
 * The UUID of the characteristic the die sends its messages on (notify).
 */
pub const PIXELS_NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0xa6b90002_7a5a_43f2_a962_350c8edc9b5b);

/**
 * The UUID of the characteristic messages to the die are written to.
 */
pub const PIXELS_WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0xa6b90003_7a5a_43f2_a962_350c8edc9b5b);

/**
 * How long (milliseconds) the die may take to answer `WhoAreYou` while connecting.
 */
pub const IDENTIFY_TIMEOUT: u64 = 2000;

/**
 * How long (milliseconds) a request waits for its response unless told otherwise.
 */
pub const REQUEST_TIMEOUT: u64 = 5000;

/**
 * Default interval (milliseconds) between automatic RSSI reports.
 */
pub const RSSI_REPORT_INTERVAL: u64 = 5000;

/**
 * Length of the manufacturer data header: led count, design and color, roll state, face index
 * and battery.
 */
pub const MANUFACTURER_DATA_LEN: usize = 5;

/**
 * Length of the service data: pixel id and firmware build timestamp.
 */
pub const SERVICE_DATA_LEN: usize = 8;

/**
 * Bit of the advertised battery byte that is set while the die is charging.
 */
pub const BATTERY_CHARGING_BIT: u8 = 0x80;

/**
 * Face mask selecting every face of any die.
 */
pub const ALL_FACES_MASK: u32 = 0xFFFF_FFFF;
