use crate::mailer::{MailSettings, SmtpSink};
use snmon_core::{NotificationSink, NotifyError};

#[test]
fn missing_credentials_disable_the_relay() {
    // Arrange
    let settings = MailSettings {
        host: Some("smtp.example.net".to_string()),
        port: 587,
        username: Some("alerts@example.net".to_string()),
        password: None,
        from: None,
    };

    // Act
    let sink = SmtpSink::new(&settings).expect("sink");

    // Assert
    assert!(!sink.is_configured());
}

#[tokio::test]
async fn unconfigured_sink_fails_every_send() {
    // Arrange
    let sink = SmtpSink::disabled();

    // Act
    let result = sink
        .send("[HIGH] CPU Usage Alert - core-1", "body", &["noc@example.net".to_string()])
        .await;

    // Assert
    assert_eq!(result, Err(NotifyError::NotConfigured));
    assert_eq!(
        NotifyError::NotConfigured.to_string(),
        "email configuration missing"
    );
}
