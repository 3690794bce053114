/**
 * How long (milliseconds) a connection attempt may take, including service discovery, unless
 * the caller supplies its own timeout.
 */
pub const CONNECT_TIMEOUT: u64 = 10_000;

/**
 * How long (milliseconds) a single characteristic read, write or subscribe may take.
 */
pub const OPERATION_TIMEOUT: u64 = 2000;

/**
 * How long (milliseconds) a disconnect request to the adapter may take before we give up waiting
 * and report the peripheral as disconnected anyway.
 */
pub const DISCONNECT_DEADLINE: u64 = 2000;


/**
 * Signal strength reported when the platform did not provide one ("not available" in HCI).
 */
pub const UNKNOWN_RSSI: i16 = 127;
