//! Active connection management settings
//!
//! Controls when idle connections are closed and when heartbeats are sent.

use std::time::Duration;

use tracing::warn;

use crate::properties::Properties;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmClose {
    Off,
    OnIdle,
    OnInvocation,
    OnInvocationAndIdle,
    OnIdleForceful,
}

impl AcmClose {
    fn from_index(v: i64) -> Option<Self> {
        Some(match v {
            0 => AcmClose::Off,
            1 => AcmClose::OnIdle,
            2 => AcmClose::OnInvocation,
            3 => AcmClose::OnInvocationAndIdle,
            4 => AcmClose::OnIdleForceful,
            _ => return None,
        })
    }

    fn index(self) -> i64 {
        match self {
            AcmClose::Off => 0,
            AcmClose::OnIdle => 1,
            AcmClose::OnInvocation => 2,
            AcmClose::OnInvocationAndIdle => 3,
            AcmClose::OnIdleForceful => 4,
        }
    }

    /// Whether an idle connection is closed once the timeout elapses
    pub fn closes_idle(self) -> bool {
        matches!(
            self,
            AcmClose::OnIdle | AcmClose::OnInvocationAndIdle | AcmClose::OnIdleForceful
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmHeartbeat {
    Off,
    OnDispatch,
    OnIdle,
    Always,
}

impl AcmHeartbeat {
    fn from_index(v: i64) -> Option<Self> {
        Some(match v {
            0 => AcmHeartbeat::Off,
            1 => AcmHeartbeat::OnDispatch,
            2 => AcmHeartbeat::OnIdle,
            3 => AcmHeartbeat::Always,
            _ => return None,
        })
    }

    fn index(self) -> i64 {
        match self {
            AcmHeartbeat::Off => 0,
            AcmHeartbeat::OnDispatch => 1,
            AcmHeartbeat::OnIdle => 2,
            AcmHeartbeat::Always => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcmConfig {
    /// Zero disables connection management
    pub timeout: Duration,
    pub heartbeat: AcmHeartbeat,
    pub close: AcmClose,
}

impl AcmConfig {
    /// Built-in defaults for server or client connections
    pub fn new(server: bool) -> Self {
        Self {
            timeout: Duration::from_secs(60),
            heartbeat: AcmHeartbeat::OnDispatch,
            close: if server {
                AcmClose::OnInvocation
            } else {
                AcmClose::OnInvocationAndIdle
            },
        }
    }

    /// Read `<prefix>.Timeout` (seconds), `<prefix>.Heartbeat` and
    /// `<prefix>.Close`, falling back to `defaults` for anything unset or
    /// invalid.
    pub fn from_properties(props: &Properties, prefix: &str, defaults: &AcmConfig) -> Self {
        let timeout_key = format!("{}.Timeout", prefix);
        // `<prefix>` alone is the older spelling of the timeout
        let timeout_key = if props.get_property(&timeout_key).is_empty()
            && !props.get_property(prefix).is_empty()
        {
            prefix.to_string()
        } else {
            timeout_key
        };
        let secs = props
            .get_property_as_int_with_default(&timeout_key, defaults.timeout.as_secs() as i64)
            .max(0);

        let hb_key = format!("{}.Heartbeat", prefix);
        let hb = props.get_property_as_int_with_default(&hb_key, defaults.heartbeat.index());
        let heartbeat = AcmHeartbeat::from_index(hb).unwrap_or_else(|| {
            warn!(
                "invalid value for property `{}', default value will be used instead",
                hb_key
            );
            defaults.heartbeat
        });

        let close_key = format!("{}.Close", prefix);
        let cl = props.get_property_as_int_with_default(&close_key, defaults.close.index());
        let close = AcmClose::from_index(cl).unwrap_or_else(|| {
            warn!(
                "invalid value for property `{}', default value will be used instead",
                close_key
            );
            defaults.close
        });

        Self {
            timeout: Duration::from_secs(secs as u64),
            heartbeat,
            close,
        }
    }

    /// Idle period after which a connection is closed, if any
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.timeout.is_zero() || !self.close.closes_idle() {
            None
        } else {
            Some(self.timeout)
        }
    }

    /// Interval between heartbeats, if heartbeats are enabled
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        if self.timeout.is_zero() || self.heartbeat == AcmHeartbeat::Off {
            None
        } else {
            Some((self.timeout / 4).max(Duration::from_millis(100)))
        }
    }
}
