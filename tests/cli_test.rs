use chrono::{Duration, Utc};
use once_cell::sync::OnceCell;
use stackjoin::cli::{Cli, CliHandler, Commands};
use stackjoin::config::Config;
use stackjoin::credentials::CredentialWindow;
use stackjoin::error::StackjoinError;
use clap::Parser;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

static TRACING: OnceCell<()> = OnceCell::new();

fn setup_logging() {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

fn handler_with_config(dir: &std::path::Path) -> Result<CliHandler, StackjoinError> {
    let path = dir.join("stackjoin.yml");
    let mut config = Config::default();
    config.node.name = "cp-2".to_string();
    config.credentials.cert_key_ttl_secs = 3600;
    config.save(&path)?;

    let loaded = Config::load(Some(&path))?;
    loaded.validate()?;
    Ok(CliHandler::new(loaded))
}

#[tokio::test]
async fn test_issue_then_validate_via_commands() -> Result<(), StackjoinError> {
    setup_logging();
    let dir = tempdir()?;
    let handler = handler_with_config(dir.path())?;
    let window_path = dir.path().join("window.yml");
    let window_arg = window_path.to_string_lossy().to_string();

    let issue = Cli::parse_from(["stackjoin", "issue", "--ca-cert-hash", "sha256:feed", "--out", &window_arg]);
    assert!(handler.execute(issue.command, CancellationToken::new()).await?);

    let window: CredentialWindow = serde_yaml::from_str(&std::fs::read_to_string(&window_path)?)?;
    assert_eq!(window.cert_key_expiry - window.issued_at, Duration::hours(1));
    assert_eq!(window.token_expiry - window.issued_at, Duration::hours(24));

    let validate = Cli::parse_from(["stackjoin", "validate", &window_arg]);
    assert!(handler.execute(validate.command, CancellationToken::new()).await?);

    let later = (Utc::now() + Duration::hours(2)).to_rfc3339();
    let validate_later = Cli::parse_from(["stackjoin", "validate", &window_arg, "--at", &later]);
    assert!(!handler.execute(validate_later.command, CancellationToken::new()).await?);
    Ok(())
}

#[tokio::test]
async fn test_decide_uses_configured_bind_behaviour() -> Result<(), StackjoinError> {
    setup_logging();
    let dir = tempdir()?;
    let handler = handler_with_config(dir.path())?;
    assert!(handler.config().cluster.api_server_binds_all_interfaces);

    let decide = Cli::parse_from(["stackjoin", "decide", "--vip-owned", "true"]);
    assert!(matches!(decide.command, Commands::Decide { .. }));
    assert!(handler.execute(decide.command, CancellationToken::new()).await?);
    Ok(())
}

#[tokio::test]
async fn test_join_without_address_is_a_config_error() -> Result<(), StackjoinError> {
    setup_logging();
    let dir = tempdir()?;
    let handler = handler_with_config(dir.path())?;
    let window_path = dir.path().join("window.yml");
    handler.issue(None, Some("sha256:feed".to_string()), Some(&window_path))?;

    let err = handler
        .join(&window_path, None, None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StackjoinError::Config(_)));
    Ok(())
}
