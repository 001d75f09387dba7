//! Centralized configuration for bridge IPC.
//!
//! Wire tokens, endpoint naming rules, and timing constants shared by the
//! host and client sides. Per-instance options live on the builders.

use std::time::Duration;

/// Wire protocol tokens and limits.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Marks the end of one message. Never legal inside an argument.
    pub const SENTINEL: &'static str = "<EOF>";
    pub const LINE_SEPARATOR: char = '\n';
    /// Acknowledgments are `finish:<operation>\n<EOF>`.
    pub const ACK_PREFIX: &'static str = "finish:";
    pub const TRUE_TOKEN: &'static str = "True";
    pub const FALSE_TOKEN: &'static str = "False";
    /// Bytes requested per socket read.
    pub const READ_CHUNK_SIZE: usize = 1024;
    /// Buffered bytes without a sentinel beyond which the stream is
    /// considered unrecoverable.
    pub const MAX_MESSAGE_SIZE: usize = 1_048_576; // 1MB
}

/// Connection id conventions and transport address ceilings.
pub struct EndpointConfig;

impl EndpointConfig {
    /// Ids starting with this prefix belong to the endpoint the main
    /// application hosts for the bridge.
    pub const BRIDGE_PREFIX: &'static str = "FLExBridgeEndpoint";
    /// Ids the bridge hosts for the main application.
    pub const APP_PREFIX: &'static str = "FLExEndpoint";
    pub const BRIDGE_TAG: &'static str = "Bridge-";
    pub const APP_TAG: &'static str = "FLEx-";
    /// Project file marker inside a connection id.
    pub const PROJECT_MARKER: &'static str = ".fwdata";
    /// Separates the project part of an id from its session suffix.
    pub const SESSION_SEPARATOR: char = '_';
    /// 108-byte `sun_path` minus the leading NUL of an abstract name.
    pub const ABSTRACT_SOCKET_MAX_LEN: usize = 107;
    /// 108-byte `sun_path` minus the trailing NUL of a filesystem path.
    pub const SOCKET_PATH_MAX_LEN: usize = 107;
    pub const PIPE_NAME_MAX_LEN: usize = 256;
    pub const PIPE_NAME_PREFIX: &'static str = r"\\.\pipe\";
    /// Sub-path appended to disambiguate channels on one pipe address.
    pub const CHANNEL_SUFFIX: &'static str = "FLExPipe";
    pub const SOCKET_FILE_EXTENSION: &'static str = ".sock";
    /// Appended to a socket path to name its ownership lock.
    pub const LOCK_FILE_EXTENSION: &'static str = ".lock";
    /// Overrides the directory used for filesystem sockets.
    pub const SOCKET_DIR_ENV: &'static str = "BRIDGE_IPC_SOCKET_DIR";
    pub const SOCKET_DIR_NAME: &'static str = "bridge-ipc";
}

/// Host runtime behaviour.
pub struct HostConfig;

impl HostConfig {
    /// How often the health monitor polls the accepted connection.
    pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(10);
    /// Capacity of the diagnostic event channel.
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
}

/// Launch option keys consumed by the connection helpers.
pub struct LaunchConfig;

impl LaunchConfig {
    pub const PIPE_ID_FLAG: &'static str = "-pipeID";
}
