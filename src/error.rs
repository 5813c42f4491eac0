/// Session-fatal failures. Every variant carries a human-readable cause, which ends up in the
/// session report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Upload failed: {0}")]
    Upload(String),
    /// The device link could not be opened within its retry budget
    #[error("Device link unavailable: {0}")]
    DeviceLink(String),
    /// The decoder failed to launch or never opened its socket
    #[error("Decoder did not start: {0}")]
    DecoderStartup(String),
    #[error("Could not spawn process: {0}")]
    Spawn(String),
    /// A relay direction broke while the session was running
    #[error("Relay broke: {0}")]
    Relay(String),
    /// The driver died without reporting a result, e.g. it was killed by a signal
    #[error("Driver crashed: {0}")]
    DriverCrash(String),
}

/// Formats an error together with its chain of sources, `anyhow` style.
pub(crate) fn cause_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut cause = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        cause.push_str(": ");
        cause.push_str(&s.to_string());
        source = s.source();
    }
    cause
}
