//! HTTP delivery of participant callbacks.

use async_trait::async_trait;
use tracing::{debug, warn};

use lra_common::{
    CallbackKind, CallbackOutcome, CallbackRequest, LraError, LraStatus, Outcome,
    ParticipantTransport, Result, LRA_HTTP_HEADER, LRA_HTTP_RECOVERY_HEADER,
};

use crate::config::CallbackConfig;

/// Calls participant endpoints over HTTP.
///
/// Complete and compensate are `PUT`s carrying the enlistment data as body,
/// status is a `GET` and forget a `DELETE`. The LRA id travels in the
/// `Long-Running-Action` header.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with the configured timeouts.
    pub fn new(config: &CallbackConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LraError::ConfigurationError(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ParticipantTransport for HttpTransport {
    async fn invoke(&self, request: &CallbackRequest) -> CallbackOutcome {
        let builder = match request.kind {
            CallbackKind::Complete | CallbackKind::Compensate => self
                .client
                .put(&request.endpoint)
                .body(request.data.clone().unwrap_or_default()),
            CallbackKind::Status => self.client.get(&request.endpoint),
            CallbackKind::Forget => self.client.delete(&request.endpoint),
        };

        let response = builder
            .header(LRA_HTTP_HEADER, request.lra_id.as_str())
            .header(LRA_HTTP_RECOVERY_HEADER, request.recovery_id())
            .send()
            .await;

        match response {
            Ok(response) => {
                let code = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                debug!(
                    lra_id = %request.lra_id,
                    participant_id = %request.participant_id,
                    kind = %request.kind,
                    code,
                    "Participant responded"
                );
                interpret_response(request.kind, request.outcome, code, &body)
            }
            Err(e) => {
                warn!(
                    lra_id = %request.lra_id,
                    participant_id = %request.participant_id,
                    endpoint = %request.endpoint,
                    error = %e,
                    "Participant unreachable"
                );
                CallbackOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Map an HTTP response onto a callback outcome.
///
/// `410 Gone` means the participant already finished and forgot the LRA; a
/// status poll answered with `404` means the same.
pub fn interpret_response(kind: CallbackKind, outcome: Outcome, code: u16, body: &str) -> CallbackOutcome {
    let reported = body.parse::<LraStatus>();

    match (kind, code) {
        (CallbackKind::Forget, 200..=299 | 404 | 410) => {
            CallbackOutcome::Finished(outcome.success_status())
        }
        (_, 202) => CallbackOutcome::InProgress,
        (CallbackKind::Complete | CallbackKind::Compensate, 200..=299) => match reported {
            Ok(status) if !outcome.matches(status) => CallbackOutcome::Failed(format!(
                "{} answered with status {}",
                kind, status
            )),
            Ok(status) if status.is_in_progress() => CallbackOutcome::InProgress,
            Ok(status) => CallbackOutcome::Finished(status),
            // body is free-form (often the participant's own resource url)
            Err(_) => CallbackOutcome::Finished(outcome.success_status()),
        },
        (CallbackKind::Complete | CallbackKind::Compensate, 410) => {
            CallbackOutcome::Finished(outcome.success_status())
        }
        (CallbackKind::Status, 200) => match reported {
            Ok(status) => CallbackOutcome::from_reported_status(status),
            Err(e) => CallbackOutcome::Failed(e.to_string()),
        },
        (CallbackKind::Status, 404 | 410) => CallbackOutcome::Finished(outcome.success_status()),
        (kind, code) => CallbackOutcome::Failed(format!("{} returned HTTP {}", kind, code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lra_common::{LraId, ParticipantId};
    use std::time::Duration;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(server: &MockServer, kind: CallbackKind, outcome: Outcome, suffix: &str) -> CallbackRequest {
        CallbackRequest {
            kind,
            lra_id: LraId::generate("http://localhost:8080/lra-coordinator"),
            participant_id: ParticipantId::new(),
            endpoint: format!("{}/activities/{}", server.uri(), suffix),
            outcome,
            data: Some("order-42".to_string()),
        }
    }

    fn transport() -> HttpTransport {
        HttpTransport::new(&CallbackConfig {
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(500),
        })
        .unwrap()
    }

    #[test]
    fn test_interpret_termination_responses() {
        let c = CallbackKind::Complete;
        assert_eq!(
            interpret_response(c, Outcome::Complete, 200, ""),
            CallbackOutcome::Finished(LraStatus::Completed)
        );
        assert_eq!(
            interpret_response(c, Outcome::Complete, 200, "FailedToComplete"),
            CallbackOutcome::Finished(LraStatus::FailedToComplete)
        );
        assert_eq!(
            interpret_response(c, Outcome::Complete, 202, ""),
            CallbackOutcome::InProgress
        );
        assert_eq!(
            interpret_response(c, Outcome::Complete, 410, ""),
            CallbackOutcome::Finished(LraStatus::Completed)
        );
        assert!(matches!(
            interpret_response(c, Outcome::Complete, 200, "Compensated"),
            CallbackOutcome::Failed(_)
        ));
        assert!(matches!(
            interpret_response(c, Outcome::Complete, 500, ""),
            CallbackOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_interpret_status_responses() {
        let s = CallbackKind::Status;
        assert_eq!(
            interpret_response(s, Outcome::Compensate, 200, "Compensated"),
            CallbackOutcome::Finished(LraStatus::Compensated)
        );
        assert_eq!(
            interpret_response(s, Outcome::Compensate, 200, "Compensating"),
            CallbackOutcome::InProgress
        );
        assert_eq!(
            interpret_response(s, Outcome::Compensate, 404, ""),
            CallbackOutcome::Finished(LraStatus::Compensated)
        );
        assert!(matches!(
            interpret_response(s, Outcome::Compensate, 200, "garbage"),
            CallbackOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_complete_sends_data_and_header() {
        let server = MockServer::start().await;
        let request = request(&server, CallbackKind::Complete, Outcome::Complete, "complete");

        Mock::given(method("PUT"))
            .and(path("/activities/complete"))
            .and(header(LRA_HTTP_HEADER, request.lra_id.as_str()))
            .and(body_string("order-42"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = transport().invoke(&request).await;
        assert_eq!(outcome, CallbackOutcome::Finished(LraStatus::Completed));
    }

    #[tokio::test]
    async fn test_accepted_compensation() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/activities/compensate"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let request = request(&server, CallbackKind::Compensate, Outcome::Compensate, "compensate");
        assert_eq!(transport().invoke(&request).await, CallbackOutcome::InProgress);
    }

    #[tokio::test]
    async fn test_status_poll() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activities/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Compensated"))
            .mount(&server)
            .await;

        let request = request(&server, CallbackKind::Status, Outcome::Compensate, "status");
        assert_eq!(
            transport().invoke(&request).await,
            CallbackOutcome::Finished(LraStatus::Compensated)
        );
    }

    #[tokio::test]
    async fn test_server_error_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let request = request(&server, CallbackKind::Compensate, Outcome::Compensate, "compensate");
        assert!(matches!(transport().invoke(&request).await, CallbackOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_slow_participant_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let request = request(&server, CallbackKind::Complete, Outcome::Complete, "complete");
        assert!(matches!(transport().invoke(&request).await, CallbackOutcome::Failed(_)));
    }

    proptest::proptest! {
        #[test]
        fn server_errors_never_finish(code in 500u16..600, body in ".*") {
            for kind in [CallbackKind::Complete, CallbackKind::Compensate, CallbackKind::Status] {
                let outcome = interpret_response(kind, Outcome::Complete, code, &body);
                proptest::prop_assert!(matches!(outcome, CallbackOutcome::Failed(_)));
            }
        }
    }
}
