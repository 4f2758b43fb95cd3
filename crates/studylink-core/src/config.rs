//! Session configuration

use std::time::Duration;

/// Tunables for a [`SessionController`](crate::SessionController)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Fresh codes tried when a registration collides
    pub registration_attempts: u32,
    /// Upper bound on opening a data channel to a join code
    pub connect_timeout: Duration,
    /// How long an outgoing call may ring before it is abandoned
    pub call_timeout: Duration,
    /// Push the foreground tool's snapshot when a link opens
    pub sync_foreground_on_connect: bool,
    /// Buffered updates per tool subscription
    pub tool_channel_capacity: usize,
    /// Buffered notices for UI subscribers
    pub notice_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            registration_attempts: 5,
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            sync_foreground_on_connect: true,
            tool_channel_capacity: 16,
            notice_channel_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registration_attempts(mut self, attempts: u32) -> Self {
        self.registration_attempts = attempts.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_sync_foreground_on_connect(mut self, enabled: bool) -> Self {
        self.sync_foreground_on_connect = enabled;
        self
    }

    pub fn with_tool_channel_capacity(mut self, capacity: usize) -> Self {
        self.tool_channel_capacity = capacity.max(1);
        self
    }

    pub fn with_notice_channel_capacity(mut self, capacity: usize) -> Self {
        self.notice_channel_capacity = capacity.max(1);
        self
    }
}
