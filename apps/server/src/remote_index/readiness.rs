use super::SearchParametersTransport;
use crate::models::LogicalResourceState;
use chrono::{DateTime, Duration, Utc};

/// What the consumer does with a message, given the committed state of its
/// logical resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The committed version is the one the message describes.
    Process,
    /// Same version but different hash or timestamp: the message came from a
    /// transaction that never committed, and another one reused the version.
    SkipMismatch,
    /// A newer version is committed. Its own message carries the values.
    SkipSuperseded { current_version: i32 },
    /// The producing transaction has not committed yet.
    NotReady,
    /// Waited longer than the ready time allows.
    Expired,
}

pub fn classify(
    message: &SearchParametersTransport,
    state: Option<&LogicalResourceState>,
    now: DateTime<Utc>,
    max_ready_time: Duration,
) -> Readiness {
    match state {
        Some(state) if state.version_id == message.version_id => {
            if !state.deleted
                && state.parameter_hash.as_deref() == Some(message.parameter_hash.as_str())
                && state.last_updated == message.last_updated
            {
                Readiness::Process
            } else {
                Readiness::SkipMismatch
            }
        }
        Some(state) if state.version_id > message.version_id => Readiness::SkipSuperseded {
            current_version: state.version_id,
        },
        _ if now - message.last_updated > max_ready_time => Readiness::Expired,
        _ => Readiness::NotReady,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_index::TransportHeader;

    fn message(version_id: i32, last_updated: DateTime<Utc>) -> SearchParametersTransport {
        SearchParametersTransport::from_values(
            TransportHeader {
                resource_type: "Patient".into(),
                logical_id: "p1".into(),
                logical_resource_id: 1,
                version_id,
                last_updated,
                parameter_hash: "h2".into(),
            },
            Vec::new(),
        )
    }

    fn state(version_id: i32, hash: &str, last_updated: DateTime<Utc>) -> LogicalResourceState {
        LogicalResourceState {
            logical_resource_id: 1,
            resource_type: "Patient".into(),
            logical_id: "p1".into(),
            version_id,
            last_updated,
            deleted: false,
            parameter_hash: Some(hash.into()),
            reindex_tstamp: None,
        }
    }

    #[test]
    fn committed_matching_version_is_processed() {
        let ts = Utc::now();
        let ready = Duration::milliseconds(120_000);
        assert_eq!(
            classify(&message(2, ts), Some(&state(2, "h2", ts)), ts, ready),
            Readiness::Process
        );
        assert_eq!(
            classify(&message(2, ts), Some(&state(2, "other", ts)), ts, ready),
            Readiness::SkipMismatch
        );
        assert_eq!(
            classify(
                &message(2, ts),
                Some(&state(2, "h2", ts + Duration::seconds(1))),
                ts,
                ready
            ),
            Readiness::SkipMismatch
        );
    }

    #[test]
    fn newer_database_version_supersedes() {
        let ts = Utc::now();
        assert_eq!(
            classify(
                &message(2, ts),
                Some(&state(3, "h3", ts)),
                ts,
                Duration::seconds(120)
            ),
            Readiness::SkipSuperseded { current_version: 3 }
        );
    }

    #[test]
    fn missing_or_older_rows_wait_until_expiry() {
        let ts = Utc::now();
        let ready = Duration::seconds(120);
        assert_eq!(classify(&message(2, ts), None, ts, ready), Readiness::NotReady);
        assert_eq!(
            classify(&message(2, ts), Some(&state(1, "h1", ts)), ts + Duration::seconds(60), ready),
            Readiness::NotReady
        );
        assert_eq!(
            classify(&message(2, ts), None, ts + Duration::seconds(121), ready),
            Readiness::Expired
        );
    }
}
