mod common;

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{ManualClock, MockConnector, Open, device, endpoint};
use mtup::reboot::RebootState;
use mtup::{Clock, ConnectionManager, Error, RebootCoordinator, RebootSettings};

fn open_session(manager: &ConnectionManager) -> Box<dyn mtup::Session> {
    manager
        .connect(&endpoint(), 1, Duration::ZERO)
        .ok()
        .expect("initial session")
}

/// Log sink shared between the subscriber and the assertions.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn count(&self, needle: &str) -> usize {
        String::from_utf8_lossy(&self.0.lock().unwrap()).matches(needle).count()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_reboot_with_prompt_then_reconnect() {
    let state = device("7.12", "arm64");
    state.lock().unwrap().version_after_reboot = Some("7.14".to_string());
    let connector = MockConnector::scripted(
        state.clone(),
        [Open::Accept, Open::Refuse, Open::Timeout],
        Open::Accept,
    );
    let clock = ManualClock::new();
    let manager = ConnectionManager::new(connector.clone(), clock.clone());
    let mut coordinator =
        RebootCoordinator::new(manager.clone(), clock.clone(), RebootSettings::default());

    let request = coordinator.reboot(open_session(&manager));
    assert!(request.prompt_detected);
    assert_eq!(coordinator.state(), RebootState::Disconnected);
    {
        let s = state.lock().unwrap();
        assert_eq!(s.reboots, 1);
        assert_eq!(s.closes, 1);
    }

    let session = coordinator
        .wait_for_reconnect(&endpoint(), request.requested_at)
        .ok()
        .expect("device back online");
    assert_eq!(coordinator.state(), RebootState::Online);
    ConnectionManager::disconnect(&mut Some(session));

    // initial + two failures + success
    assert_eq!(connector.attempts(), 4);
    assert_eq!(state.lock().unwrap().version, "7.14");
    assert_eq!(clock.elapsed(), Duration::from_secs(21));
}

#[test]
fn test_reboot_without_prompt_sends_confirmation_anyway() {
    let state = device("7.12", "arm64");
    state.lock().unwrap().reboot_prompt = false;
    let connector = MockConnector::new(state.clone());
    let clock = ManualClock::new();
    let manager = ConnectionManager::new(connector, clock.clone());
    let mut coordinator =
        RebootCoordinator::new(manager.clone(), clock.clone(), RebootSettings::default());

    let request = coordinator.reboot(open_session(&manager));

    assert!(!request.prompt_detected);
    let s = state.lock().unwrap();
    assert_eq!(s.reboots, 1);
    assert_eq!(s.commands, vec!["/system reboot", "", "y"]);
    assert_eq!(clock.sleeps(), vec![RebootSettings::default().prompt_grace]);
}

#[test]
fn test_probe_failures_count_as_not_ready() {
    let state = device("7.14", "arm64");
    state.lock().unwrap().probe_failures = 2;
    let connector = MockConnector::new(state.clone());
    let clock = ManualClock::new();
    let manager = ConnectionManager::new(connector.clone(), clock.clone());
    let mut coordinator = RebootCoordinator::new(manager, clock.clone(), RebootSettings::default());

    let session = coordinator
        .wait_for_reconnect(&endpoint(), clock.now())
        .ok()
        .expect("device back online");
    ConnectionManager::disconnect(&mut Some(session));

    let s = state.lock().unwrap();
    assert_eq!(connector.attempts(), 3);
    // Every opened candidate is closed exactly once
    assert_eq!(s.opens, 3);
    assert_eq!(s.closes, 3);
}

#[test]
fn test_reconnect_timeout_is_bounded() {
    let state = device("7.12", "arm64");
    let connector = MockConnector::scripted(state.clone(), [Open::Accept], Open::Refuse);
    let clock = ManualClock::new();
    let manager = ConnectionManager::new(connector, clock.clone());
    let settings = RebootSettings::default();
    let mut coordinator = RebootCoordinator::new(manager.clone(), clock.clone(), settings);

    let request = coordinator.reboot(open_session(&manager));
    let err = coordinator
        .wait_for_reconnect(&endpoint(), request.requested_at)
        .err()
        .unwrap();

    assert!(matches!(err, Error::Timeout { .. }));
    assert!(err.to_string().contains("300 seconds"));
    assert_eq!(coordinator.state(), RebootState::TimedOut);
    assert!(clock.elapsed() > settings.reconnect_timeout);
    assert!(clock.elapsed() <= settings.reconnect_timeout + settings.reconnect_delay);
}

#[test]
fn test_heartbeat_once_per_minute_while_polling() {
    let state = device("7.12", "arm64");
    let connector = MockConnector::scripted(state, [], Open::Refuse);
    let clock = ManualClock::new();
    let manager = ConnectionManager::new(connector.clone(), clock.clone());
    let mut coordinator = RebootCoordinator::new(manager, clock.clone(), RebootSettings::default());

    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let outcome = tracing::subscriber::with_default(subscriber, || {
        coordinator.wait_for_reconnect(&endpoint(), clock.now())
    });

    assert!(matches!(outcome.err(), Some(Error::Timeout { .. })));
    // 31 polls 10 s apart over five minutes
    assert_eq!(connector.attempts(), 31);
    assert_eq!(logs.count("Still waiting for device to reconnect"), 5);
}
