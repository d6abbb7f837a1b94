use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant, SystemTime},
};

use cashell::{
    Session, Severity, Subscription,
    dbr::DbrValue,
    loopback::{LoopbackChannel, LoopbackContext},
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

const WAIT: Option<Duration> = Some(Duration::from_secs(2));

fn loopback_session() -> (LoopbackContext, Session<LoopbackContext>) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_writer(TestWriter::new())
        .try_init();
    let context = LoopbackContext::new().unwrap();
    let session = Session::new(context.clone());
    (context, session)
}

/// Block until the subscription has delivered `value`
fn wait_for_last(sub: &Subscription<LoopbackChannel>, value: &DbrValue) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while sub.last().map(|e| e.into_value()).as_ref() != Some(value) {
        assert!(Instant::now() < deadline, "never received {value}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_initial_and_later_updates() {
    let (context, session) = loopback_session();
    let pv = context.add_pv("COUNT", 1i32).unwrap();
    let sub = session.monitor("COUNT").unwrap();
    assert_eq!(sub.name(), "COUNT");
    assert_eq!(sub.capacity(), 1);

    let first = sub.wait_for(WAIT).unwrap();
    assert_eq!(first.value(), &DbrValue::Long(vec![1]));
    assert_eq!(sub.wait_for(Some(Duration::ZERO)), None);

    pv.store(2i32).unwrap();
    let second = sub.wait_for(WAIT).unwrap();
    assert_eq!(second.value(), &DbrValue::Long(vec![2]));
    assert!(second.timestamp() >= first.timestamp());
    assert_eq!(pv.monitor_count(), 1);

    sub.close();
    assert_eq!(pv.monitor_count(), 0);
    session.close();
}

#[test]
fn test_capacity_one_keeps_newest() {
    let (context, session) = loopback_session();
    let pv = context.add_pv("FAST", 0i32).unwrap();
    let sub = session.monitor("FAST").unwrap();
    sub.set_capacity(1);
    sub.wait_for(WAIT).unwrap();

    for value in 1..=3i32 {
        pv.store(value).unwrap();
    }
    wait_for_last(&sub, &DbrValue::Long(vec![3]));
    assert_eq!(sub.len(), 1);
    assert_eq!(sub.wait_for(Some(Duration::ZERO)).unwrap().value(), &DbrValue::Long(vec![3]));
    assert_eq!(sub.wait_for(Some(Duration::ZERO)), None);
    sub.close();
    session.close();
}

#[test]
fn test_larger_capacity_is_fifo() {
    let (context, session) = loopback_session();
    let pv = context.add_pv("FIFO", 0i32).unwrap();
    let sub = session.monitor("FIFO").unwrap();
    sub.set_capacity(3);
    sub.wait_for(WAIT).unwrap();

    for value in 1..=5i32 {
        pv.store(value).unwrap();
    }
    wait_for_last(&sub, &DbrValue::Long(vec![5]));
    let drained: Vec<_> = std::iter::from_fn(|| sub.try_next())
        .map(|e| e.into_value())
        .collect();
    assert_eq!(
        drained,
        vec![
            DbrValue::Long(vec![3]),
            DbrValue::Long(vec![4]),
            DbrValue::Long(vec![5])
        ]
    );
    sub.close();
    session.close();
}

#[test]
fn test_disconnect_synthesizes_invalid_event() {
    let (context, session) = loopback_session();
    let pv = context.add_pv("FLAKY", 10i32).unwrap();
    let sub = session.monitor("FLAKY").unwrap();
    sub.set_capacity(10);
    sub.wait_for(WAIT).unwrap();

    // A server clock ahead of ours must still be exceeded
    let ahead = SystemTime::now() + Duration::from_secs(60);
    pv.store_at(11i32, ahead).unwrap();
    let real = sub.wait_for(WAIT).unwrap();
    assert_eq!(real.timestamp(), ahead);

    pv.disconnect();
    let synthetic = sub.wait_for(WAIT).unwrap();
    assert_eq!(synthetic.severity(), Severity::Invalid);
    assert_eq!(synthetic.value(), &DbrValue::Long(vec![11]));
    assert!(synthetic.timestamp() > ahead);
    assert_eq!(pv.monitor_count(), 0);
    assert!(!sub.is_closed());

    // Still alive after a disconnect, and picks up again on reconnection
    pv.reconnect();
    let resumed = sub.wait_for(WAIT).unwrap();
    assert_eq!(resumed.value(), &DbrValue::Long(vec![11]));
    assert_eq!(resumed.severity(), Severity::NoAlarm);
    assert!(resumed.timestamp() >= synthetic.timestamp());
    assert_eq!(pv.monitor_count(), 1);
    sub.close();
    session.close();
}

#[test]
fn test_disconnect_before_any_update() {
    let (context, session) = loopback_session();
    let sub = session.monitor("LATE").unwrap();
    assert_eq!(sub.wait_for(Some(Duration::from_millis(100))), None);

    let pv = context.add_pv("LATE", 1.5f64).unwrap();
    assert_eq!(sub.wait_for(WAIT).unwrap().value(), &DbrValue::Double(vec![1.5]));
    sub.close();
    drop(pv);
    session.close();
}

#[test]
fn test_alarm_updates() {
    let (context, session) = loopback_session();
    let pv = context.add_pv("TEMP", 20.0f64).unwrap();
    let sub = session.monitor("TEMP").unwrap();
    sub.wait_for(WAIT).unwrap();

    pv.set_severity(Severity::Minor);
    assert_eq!(sub.wait_for(WAIT).unwrap().severity(), Severity::Minor);
    pv.set_severity(Severity::Invalid);
    assert_eq!(sub.wait_for(WAIT).unwrap().severity(), Severity::Invalid);
    sub.close();
    session.close();
}

#[test]
fn test_unsupported_native_type() {
    let (context, session) = loopback_session();
    let pv = context.add_pv("MODE", DbrValue::Enum(2)).unwrap();
    let sub = session.monitor("MODE").unwrap();
    assert_eq!(sub.wait_for(Some(Duration::from_millis(200))), None);
    assert_eq!(pv.monitor_count(), 0);
    assert!(!sub.is_closed());
    sub.close();
    session.close();
}

#[test]
fn test_listeners() {
    let (context, session) = loopback_session();
    let pv = context.add_pv("L", 0i32).unwrap();
    let sub = session.monitor("L").unwrap();
    sub.set_capacity(100);
    wait_for_last(&sub, &DbrValue::Long(vec![0]));

    let seen = Arc::new(Mutex::new(Vec::new()));
    sub.add_listener(|_| panic!("a broken listener"));
    let record = seen.clone();
    let key = sub.add_listener(move |envelope| {
        record.lock().unwrap().push(envelope.value().clone());
    });

    for value in 1..=3i32 {
        pv.store(value).unwrap();
    }
    wait_for_last(&sub, &DbrValue::Long(vec![3]));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            DbrValue::Long(vec![1]),
            DbrValue::Long(vec![2]),
            DbrValue::Long(vec![3])
        ]
    );
    // The broken listener did not affect the queue
    assert_eq!(sub.len(), 4);

    assert!(sub.remove_listener(key));
    pv.store(4i32).unwrap();
    wait_for_last(&sub, &DbrValue::Long(vec![4]));
    assert_eq!(seen.lock().unwrap().len(), 3);
    sub.close();
    session.close();
}

#[test]
fn test_blocking_wait_wakes_on_update() {
    let (context, session) = loopback_session();
    let pv = context.add_pv("SLOW", 0i32).unwrap();
    let sub = Arc::new(session.monitor("SLOW").unwrap());
    sub.wait_for(WAIT).unwrap();

    let waiter = {
        let sub = sub.clone();
        thread::spawn(move || sub.wait_for(None))
    };
    thread::sleep(Duration::from_millis(100));
    pv.store(5i32).unwrap();
    let envelope = waiter.join().unwrap().unwrap();
    assert_eq!(envelope.value(), &DbrValue::Long(vec![5]));

    // Closing releases a waiter blocked forever
    let waiter = {
        let sub = sub.clone();
        thread::spawn(move || sub.wait_for(None))
    };
    thread::sleep(Duration::from_millis(100));
    sub.close();
    assert_eq!(waiter.join().unwrap(), None);
    session.close();
}

#[test]
fn test_unrepresentable_wait_blocks_until_update() {
    let (context, session) = loopback_session();
    let pv = context.add_pv("PATIENT", 0i32).unwrap();
    let sub = Arc::new(session.monitor("PATIENT").unwrap());
    sub.wait_for(WAIT).unwrap();

    let waiter = {
        let sub = sub.clone();
        thread::spawn(move || sub.wait_for(Some(Duration::MAX)))
    };
    thread::sleep(Duration::from_millis(100));
    pv.store(9i32).unwrap();
    let envelope = waiter.join().unwrap().unwrap();
    assert_eq!(envelope.value(), &DbrValue::Long(vec![9]));
    sub.close();
    session.close();
}

#[test]
fn test_session_close_leaves_subscription_open() {
    let (context, session) = loopback_session();
    context.add_pv("KEEP", 1i32).unwrap();
    let sub = session.monitor("KEEP").unwrap();
    sub.wait_for(WAIT).unwrap();
    session.close();
    assert!(!sub.is_closed());
    sub.close();
    assert!(sub.is_closed());
}

#[test]
fn test_clear_and_defaults() {
    let (context, session) = loopback_session();
    let pv = context.add_pv("Q", 0i32).unwrap();
    let sub = session.monitor("Q").unwrap();
    assert_eq!(sub.timeout(), Some(cashell::DEFAULT_WAIT_TIMEOUT));
    sub.set_capacity(5);
    sub.wait_for(WAIT).unwrap();
    pv.store(1i32).unwrap();
    wait_for_last(&sub, &DbrValue::Long(vec![1]));
    assert!(!sub.is_empty());
    sub.clear();
    assert!(sub.is_empty());
    assert_eq!(sub.last().unwrap().value(), &DbrValue::Long(vec![1]));

    sub.set_timeout(Some(Duration::from_millis(50)));
    assert_eq!(sub.wait(), None);
    sub.close();
    session.close();
}
