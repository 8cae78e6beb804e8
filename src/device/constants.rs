use uuid::Uuid;

/**
 * The advertised name prefix of the servo controller firmware.
 */
pub const DEVICE_NAME_PREFIX: &str = "CLO";

/**
 * The UUID of the Bluetooth BLE service that owns the servo characteristics.
 */
pub const MOTOR_SERVICE: Uuid = Uuid::from_u128(0xff010000_1000_8000_0080_5f9b34fb0000);

/**
 * The UUID of the Bluetooth BLE remote GATT characteristic to send servo command frames to.
 */
pub const MOTOR_COMMAND_CHARACTERISTIC: Uuid = Uuid::from_u128(0xef010001_1000_8000_0080_5f9b34fb0000);

/**
 * The UUID of the Bluetooth BLE remote GATT characteristic that notifies servo telemetry frames.
 */
pub const MOTOR_TELEMETRY_CHARACTERISTIC: Uuid = Uuid::from_u128(0xef010002_1000_8000_0080_5f9b34fb0000);

/**
 * How long (milliseconds) a connect attempt (including service discovery) may take.
 */
pub const CONNECT_DEADLINE: u64 = 10_000;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) to scan for a matching device before giving up.
 */
pub const SCAN_DEADLINE: u64 = 30_000;

/**
 * The MTU to ask for when connecting.
 */
pub const REQUESTED_MTU: u16 = 512;

/**
 * The ATT MTU every BLE link starts with, used when the transport cannot report the negotiated one.
 */
pub const DEFAULT_ATT_MTU: u16 = 23;

pub const FRAME_FORMAT_MARKER: u8 = 0xAA;
pub const FRAME_SUB_MARKER: u8 = 0x56;
pub const FRAME_COMMAND_MARKER: u8 = 0x01;
pub const FRAME_TELEMETRY_MARKER: u8 = 0x81; // command marker with the reply bit set

pub const COMMAND_HEADER: [u8; 3] = [FRAME_FORMAT_MARKER, FRAME_SUB_MARKER, FRAME_COMMAND_MARKER];
pub const TELEMETRY_HEADER: [u8; 3] = [FRAME_FORMAT_MARKER, FRAME_SUB_MARKER, FRAME_TELEMETRY_MARKER];

/**
 * One servo group on the wire: 1 byte id + 2 bytes big-endian angle in tenths of a degree.
 */
pub const SERVO_GROUP_LEN: usize = 3;

/**
 * Range (degrees) the servos accept. Commanded angles are clamped to this range.
 */
pub const MIN_ANGLE: f32 = 0.0;
pub const MAX_ANGLE: f32 = 180.0;

/**
 * Largest angle (degrees) an angle group can carry.
 */
pub const MAX_WIRE_ANGLE: f32 = u16::MAX as f32 / 10.0;
