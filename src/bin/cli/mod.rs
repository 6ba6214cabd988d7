pub mod args;
pub mod plain;

/// Exit codes for different error conditions
pub mod exit_codes {
    /// Stopped on request, or gave up on the broker with reconnect disabled
    pub const SUCCESS: u8 = 0;
    /// Connector misuse (started twice or before registration)
    pub const USAGE_ERROR: u8 = 1;
    /// Invalid settings or unreadable TLS material
    pub const CONFIG_ERROR: u8 = 2;
}
