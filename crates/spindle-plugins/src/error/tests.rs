//! Unit tests for plugin error types.

use std::io;
use std::path::PathBuf;

use rstest::rstest;

use super::*;

#[test]
fn unsupported_runtime_message_includes_root() {
    let error = PluginError::UnsupportedRuntime {
        name: "lonely".into(),
        root: PathBuf::from("/srv/plugins/lonely"),
    };
    let message = error.to_string();
    assert!(message.contains("lonely"), "expected name in message: {message}");
    assert!(
        message.contains("/srv/plugins/lonely"),
        "expected root in message: {message}"
    );
}

#[test]
fn process_exited_message_carries_output_tail() {
    let error = PluginError::ProcessExited {
        name: "crashy".into(),
        exit: ExitSummary::from_code(Some(3)),
        output: OutputTail::from_lines(vec!["boom".into(), "traceback".into()]),
    };
    let message = error.to_string();
    assert!(message.contains("exit code 3"), "got: {message}");
    assert!(message.contains("boom"), "got: {message}");
    assert!(message.contains("traceback"), "got: {message}");
}

#[test]
fn launch_timeout_without_output_has_no_trailer() {
    let error = PluginError::LaunchTimeout {
        name: "slow".into(),
        timeout_ms: 250,
        output: OutputTail::default(),
    };
    assert_eq!(error.to_string(), "plugin 'slow' was not ready after 250ms");
}

#[rstest]
#[case::ports(PluginError::PortsExhausted { attempts: 8 }, true)]
#[case::shutdown(PluginError::ShuttingDown, true)]
#[case::call_timeout(
    PluginError::CallTimeout { name: "p".into(), timeout_ms: 5 },
    false
)]
#[case::fetch(
    PluginError::Fetch { reference: "r".into(), message: "missing".into() },
    false
)]
fn manager_fatal_classification(#[case] error: PluginError, #[case] expected: bool) {
    assert_eq!(error.is_manager_fatal(), expected);
}

#[test]
fn io_error_is_shared_between_clones() {
    let error = PluginError::io("p", io::Error::other("pipe closed"));
    let clone = error.clone();
    match (&error, &clone) {
        (PluginError::Io { source: a, .. }, PluginError::Io { source: b, .. }) => {
            assert!(Arc::ptr_eq(a, b));
        }
        other => panic!("unexpected variants: {other:?}"),
    }
}

#[test]
fn spawn_failed_exposes_source() {
    use std::error::Error as _;

    let error = PluginError::SpawnFailed {
        name: "p".into(),
        message: "permission denied".into(),
        source: Some(Arc::new(io::Error::from(io::ErrorKind::PermissionDenied))),
    };
    assert!(error.source().is_some());
}
