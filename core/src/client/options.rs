// Client options: protocol, timeouts and retry policies
//
// Everything the engine needs is passed in here at construction; there are
// no process-wide defaults to mutate.

use rand::Rng;
use std::time::Duration;

/// Subprotocol spoken over the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// `json.webpubsub.azure.v1`: no sequence ids, no recovery
    Json,
    /// `json.reliable.webpubsub.azure.v1`: sequence ids and recoverable reconnects
    JsonReliable,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Json => "json.webpubsub.azure.v1",
            Protocol::JsonReliable => "json.reliable.webpubsub.azure.v1",
        }
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self, Protocol::JsonReliable)
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "json.webpubsub.azure.v1" | "json" => Some(Protocol::Json),
            "json.reliable.webpubsub.azure.v1" | "reliable" => Some(Protocol::JsonReliable),
            _ => None,
        }
    }
}

/// Bounded retry schedule: capped exponential backoff, optionally jittered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Connect attempts before giving up (0 disables the phase)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Spread each delay uniformly over `[delay / 2, delay]`
    pub jitter: bool,
}

impl RetryPolicy {
    /// Same delay between every attempt
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Doubling delay starting at `base_delay`, capped at `max_delay`
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0 = first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let backoff_ms = base_ms.saturating_mul(2u64.saturating_pow(retry.min(16)));
        let capped = Duration::from_millis(backoff_ms).min(self.max_delay);
        if self.jitter && !capped.is_zero() {
            let half = capped / 2;
            let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
            half + Duration::from_millis(spread)
        } else {
            capped
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct WebPubSubClientOptions {
    pub protocol: Protocol,
    /// Open a new logical session after an unrecoverable close
    pub auto_reconnect: bool,
    /// Replay joined groups on a new logical session
    pub auto_rejoin_groups: bool,
    /// Deadline for each ack-tracked operation
    pub ack_timeout: Duration,
    /// How often outstanding acks are checked against their deadlines
    pub ack_sweep_interval: Duration,
    /// How often the highest received sequence id is acknowledged
    pub sequence_ack_interval: Duration,
    /// Attempts to resume the same logical session
    pub recovery_policy: RetryPolicy,
    /// Attempts to open a new logical session
    pub reconnect_policy: RetryPolicy,
}

impl Default for WebPubSubClientOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::JsonReliable,
            auto_reconnect: true,
            auto_rejoin_groups: true,
            ack_timeout: Duration::from_secs(30),
            ack_sweep_interval: Duration::from_secs(1),
            sequence_ack_interval: Duration::from_secs(1),
            recovery_policy: RetryPolicy::fixed(30, Duration::from_secs(1)),
            reconnect_policy: RetryPolicy::exponential(
                10,
                Duration::from_secs(1),
                Duration::from_secs(30),
            )
            .with_jitter(true),
        }
    }
}

impl WebPubSubClientOptions {
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_auto_rejoin_groups(mut self, enabled: bool) -> Self {
        self.auto_rejoin_groups = enabled;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_ack_sweep_interval(mut self, interval: Duration) -> Self {
        self.ack_sweep_interval = interval;
        self
    }

    pub fn with_sequence_ack_interval(mut self, interval: Duration) -> Self {
        self.sequence_ack_interval = interval;
        self
    }

    pub fn with_recovery_policy(mut self, policy: RetryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names() {
        assert_eq!(Protocol::Json.name(), "json.webpubsub.azure.v1");
        assert!(Protocol::JsonReliable.is_reliable());
        assert!(!Protocol::Json.is_reliable());
        assert_eq!(Protocol::parse("reliable"), Some(Protocol::JsonReliable));
        assert_eq!(
            Protocol::parse("json.webpubsub.azure.v1"),
            Some(Protocol::Json)
        );
        assert_eq!(Protocol::parse("protobuf"), None);
    }

    #[test]
    fn test_backoff_duration() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(2));

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        // Capped
        assert_eq!(policy.delay_for(10), Duration::from_secs(2));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(policy.delay_for(0), policy.delay_for(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(400), Duration::from_secs(10))
            .with_jitter(true);
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn test_options_builders() {
        let options = WebPubSubClientOptions::default()
            .with_protocol(Protocol::Json)
            .with_auto_reconnect(false)
            .with_ack_timeout(Duration::from_millis(250));
        assert_eq!(options.protocol, Protocol::Json);
        assert!(!options.auto_reconnect);
        assert!(options.auto_rejoin_groups);
        assert_eq!(options.ack_timeout, Duration::from_millis(250));
    }
}
