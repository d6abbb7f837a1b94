use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use cashell::{
    AppValue, CaStatus, CoercionError, Error, Session, Severity,
    coerce::ElementKind,
    dbr::{DBR_TIME_STRING, DbrValue},
    loopback::LoopbackContext,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_writer(TestWriter::new())
        .try_init();
}

/// A session over a fresh loopback context, with a short timeout
fn loopback_session(timeout: Duration) -> (LoopbackContext, Session<LoopbackContext>) {
    init_logging();
    let context = LoopbackContext::new().unwrap();
    let session = Session::new(context.clone());
    session.set_timeout(timeout).unwrap();
    (context, session)
}

#[test]
fn test_read_native_type() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    context.add_pv("DOUBLE", 4.5f64).unwrap();
    context.add_pv("WAVE", vec![1i16, 2, 3]).unwrap();
    context.add_pv("NAME", "beamline").unwrap();

    let envelope = session.read("DOUBLE").unwrap();
    assert_eq!(envelope.value(), &DbrValue::Double(vec![4.5]));
    assert_eq!(envelope.severity(), Severity::NoAlarm);
    assert_eq!(
        session.read_value("WAVE").unwrap(),
        DbrValue::Int(vec![1, 2, 3])
    );
    assert_eq!(
        session.read_as::<String>("NAME").unwrap(),
        vec!["beamline".to_string()]
    );
    assert_eq!(session.read_as::<f64>("WAVE").unwrap(), vec![1.0, 2.0, 3.0]);

    context.add_pv("BIG", 500i32).unwrap();
    assert_eq!(
        session.read_as::<i8>("BIG").unwrap_err(),
        Error::NoConvert {
            name: "BIG".to_string()
        }
    );
    session.close();
}

#[test]
fn test_lookup_reuses_channels() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    context.add_pv("A", 1i32).unwrap();
    for _ in 0..3 {
        session.read("A").unwrap();
    }
    assert_eq!(context.stats().channels_created, 1);
    assert!(session.is_cached("A"));

    session.disconnect(["A"]);
    assert!(!session.is_cached("A"));
    assert_eq!(context.stats().channels_open(), 0);
    session.read("A").unwrap();
    assert_eq!(context.stats().channels_created, 2);
    session.close();
}

#[test]
fn test_concurrent_reads_share_channel() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    context.add_pv("SHARED", 7i32).unwrap();
    let session = Arc::new(session);
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let session = session.clone();
            thread::spawn(move || session.read_value("SHARED").unwrap())
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), DbrValue::Long(vec![7]));
    }
    let stats = context.stats();
    assert_eq!(stats.channels_open(), 1);
    session.close();
    assert_eq!(context.stats().channels_open(), 0);
}

#[test]
fn test_read_timeout() {
    let (_context, session) = loopback_session(Duration::from_millis(500));
    let start = Instant::now();
    let err = session.read("NEVER:CONNECTS").unwrap_err();
    let elapsed = start.elapsed();
    assert!(err.is_timeout(), "{err}");
    assert_eq!(err.pv_name(), Some("NEVER:CONNECTS"));
    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");
    session.close();
}

#[test]
fn test_late_answer_is_discarded() {
    init_logging();
    let context = LoopbackContext::with_latency(Duration::from_millis(300)).unwrap();
    context.add_pv("SLOW", 1i32).unwrap();
    let session = Session::new(context.clone());
    session.set_timeout(Duration::from_millis(100)).unwrap();
    assert!(session.read("SLOW").unwrap_err().is_timeout());

    // Let the abandoned request finish in the background
    thread::sleep(Duration::from_millis(800));
    session.set_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(session.read_value("SLOW").unwrap(), DbrValue::Long(vec![1]));
    session.close();
}

#[test]
fn test_invalid_alarm_policy() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    let pv = context.add_pv("ALARMED", 3.0f64).unwrap();

    pv.set_severity(Severity::Major);
    assert_eq!(session.read("ALARMED").unwrap().severity(), Severity::Major);

    pv.set_severity(Severity::Invalid);
    assert_eq!(
        session.read("ALARMED").unwrap_err(),
        Error::InvalidAlarm("ALARMED".to_string())
    );
    // No policy for explicit fetches and batches
    let envelope = session.fetch("ALARMED", None, None).unwrap();
    assert_eq!(envelope.severity(), Severity::Invalid);
    let batch = session.read_many(["ALARMED"]).unwrap();
    assert_eq!(batch[0].as_ref().unwrap().severity(), Severity::Invalid);
    session.close();
}

#[test]
fn test_fetch_explicit_type() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    context
        .add_pv("WAVE", vec![1.5f64, 2.5, 3.5])
        .unwrap();
    let envelope = session.fetch("WAVE", Some(DBR_TIME_STRING), Some(2)).unwrap();
    assert_eq!(
        envelope.value(),
        &DbrValue::String(vec!["1.5".to_string(), "2.5".to_string()])
    );

    let pv = context.add_pv("OPAQUE", 12i32).unwrap();
    pv.set_native_type_unknown();
    assert_eq!(
        session.read_value("OPAQUE").unwrap(),
        DbrValue::String(vec!["12".to_string()])
    );
    session.close();
}

#[test]
fn test_read_many_partial() {
    let (context, session) = loopback_session(Duration::from_millis(500));
    context.add_pv("a", 1i32).unwrap();
    context.add_pv("c", 3i32).unwrap();

    let start = Instant::now();
    let results = session.read_many(["a", "b", "c"]).unwrap();
    assert!(start.elapsed() < Duration::from_millis(1500));
    assert_eq!(results.len(), 3);
    assert_eq!(
        results[0].as_ref().unwrap().value(),
        &DbrValue::Long(vec![1])
    );
    assert!(results[1].is_none());
    assert_eq!(
        results[2].as_ref().unwrap().value(),
        &DbrValue::Long(vec![3])
    );
    session.close();
}

#[test]
fn test_read_many_shares_deadline() {
    let (_context, session) = loopback_session(Duration::from_millis(300));
    let start = Instant::now();
    let results = session.read_many(["x", "y", "z"]).unwrap();
    assert_eq!(results, vec![None, None, None]);
    // One deadline for the batch, not one per name
    assert!(start.elapsed() < Duration::from_millis(800));
    session.close();
}

#[test]
fn test_read_many_fails_on_lost_connection() {
    init_logging();
    let context = LoopbackContext::with_latency(Duration::from_millis(300)).unwrap();
    context.add_pv("a", 1i32).unwrap();
    let b = context.add_pv("b", 2i32).unwrap();
    let session = Arc::new(Session::new(context.clone()));
    session.set_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(session.read_many(["a", "b"]).unwrap().len(), 2);

    let reader = {
        let session = session.clone();
        thread::spawn(move || session.read_many(["a", "b"]))
    };
    thread::sleep(Duration::from_millis(100));
    b.disconnect();
    assert_eq!(
        reader.join().unwrap(),
        Err(Error::ConnectionLost("b".to_string()))
    );
    session.close();
}

#[test]
fn test_unrepresentable_timeout_never_expires() {
    let (context, session) = loopback_session(Duration::from_secs(1));
    context.add_pv("FAR", 1i32).unwrap();
    context.add_pv("AWAY", 2i32).unwrap();
    session.set_timeout(Duration::MAX).unwrap();
    assert_eq!(session.timeout(), Duration::MAX);

    assert_eq!(session.read_value("FAR").unwrap(), DbrValue::Long(vec![1]));
    session.write("FAR", 5i32, true).unwrap();
    let results = session.read_many(["FAR", "AWAY"]).unwrap();
    assert_eq!(
        results
            .into_iter()
            .map(|r| r.unwrap().into_value())
            .collect::<Vec<_>>(),
        vec![DbrValue::Long(vec![5]), DbrValue::Long(vec![2])]
    );
    session.close();
}

#[test]
fn test_write_coercion() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    let scalar = context.add_pv("SCALAR", 0.0f64).unwrap();
    let wave = context.add_pv_with_capacity("WAVE", vec![0i32], 10).unwrap();
    let text = context.add_pv("TEXT", "").unwrap();

    session.write("SCALAR", 4.2f64, true).unwrap();
    assert_eq!(scalar.load(), DbrValue::Double(vec![4.2]));

    session.write("WAVE", vec![1i32, 2, 3], true).unwrap();
    assert_eq!(wave.load(), DbrValue::Long(vec![1, 2, 3]));

    session.write("WAVE", vec![7u16, 8], true).unwrap();
    assert_eq!(wave.load(), DbrValue::Long(vec![7, 8]));

    session.write("TEXT", "hello", true).unwrap();
    assert_eq!(text.load(), DbrValue::String(vec!["hello".to_string()]));

    // Strings written to numeric PVs are parsed by the server
    session.write("SCALAR", "1.25", true).unwrap();
    assert_eq!(scalar.load(), DbrValue::Double(vec![1.25]));

    assert_eq!(
        session.write("SCALAR", vec![1i64, 2], true).unwrap_err(),
        Error::Coercion(CoercionError::Unsupported(ElementKind::Int64))
    );
    assert_eq!(
        session
            .write("SCALAR", AppValue::List(vec![AppValue::List(vec![])]), true)
            .unwrap_err(),
        Error::Coercion(CoercionError::Nested)
    );
    session.close();
}

#[test]
fn test_write_size_exceeded_before_put() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    let pv = context.add_pv_with_capacity("SMALL", vec![0i32, 0], 2).unwrap();
    assert_eq!(
        session.write("SMALL", vec![1i32, 2, 3], true).unwrap_err(),
        Error::SizeExceeded {
            name: "SMALL".to_string(),
            requested: 3,
            max: 2
        }
    );
    assert_eq!(context.stats().puts, 0);
    assert_eq!(pv.load(), DbrValue::Long(vec![0, 0]));
    session.close();
}

#[test]
fn test_write_rejected() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    let pv = context.add_pv("LOCKED", 1i32).unwrap();
    pv.reject_puts(Some(CaStatus::NoWtAccess));
    assert_eq!(
        session.write("LOCKED", 5i32, true).unwrap_err(),
        Error::Protocol {
            name: "LOCKED".to_string(),
            status: CaStatus::NoWtAccess
        }
    );
    // Without acknowledgement the rejection is never seen
    session.write("LOCKED", 5i32, false).unwrap();
    pv.reject_puts(None);
    session.write("LOCKED", 6i32, false).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while pv.load() != DbrValue::Long(vec![6]) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(pv.load(), DbrValue::Long(vec![6]));
    session.close();
}

#[test]
fn test_write_to_disconnected() {
    let (context, session) = loopback_session(Duration::from_millis(300));
    let pv = context.add_pv("DROPS", 1i32).unwrap();
    session.read("DROPS").unwrap();
    pv.disconnect();
    assert!(session.write("DROPS", 2i32, true).unwrap_err().is_timeout());
    pv.reconnect();
    session.write("DROPS", 2i32, true).unwrap();
    assert_eq!(pv.load(), DbrValue::Long(vec![2]));
    session.close();
}

#[test]
fn test_unsigned_helpers() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    let pv = context
        .add_pv("REGISTER", vec![-1i32, 0x7fff_ffff, -2])
        .unwrap();
    assert_eq!(session.read_uint("REGISTER").unwrap(), 0xffff_ffff);
    assert_eq!(
        session.read_uint_array("REGISTER", 3).unwrap(),
        vec![0xffff_ffff, 0x7fff_ffff, 0xffff_fffe]
    );

    context.add_pv("BITS", 0i32).unwrap();
    session.write_uint("BITS", 0xffff_fffe, true).unwrap();
    assert_eq!(session.read_uint("BITS").unwrap(), 0xffff_fffe);
    // Only the low 32 bits are sent
    session.write_uint("BITS", 0x1_0000_0005, true).unwrap();
    assert_eq!(session.read_uint("BITS").unwrap(), 5);
    drop(pv);
    session.close();
}

#[test]
fn test_timeout_management() {
    let (_context, session) = loopback_session(Duration::from_secs(1));
    assert_eq!(
        session.set_timeout(Duration::from_millis(250)),
        Ok(Duration::from_secs(1))
    );
    assert_eq!(session.timeout(), Duration::from_millis(250));
    assert_eq!(
        session.set_timeout(Duration::ZERO),
        Err(Error::InvalidTimeout)
    );
    assert_eq!(session.timeout(), Duration::from_millis(250));
    assert!(session.info().contains("timeout 0.250 s"));
    assert!(session.info().contains("Loopback context"));
    session.close();
}

#[test]
fn test_connect_ahead() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    context.add_pv("ONE", 1i32).unwrap();
    session.connect(["ONE", "TWO", ""]);
    assert!(session.is_cached("ONE"));
    assert!(session.is_cached("TWO"));
    assert!(!session.is_cached(""));
    assert_eq!(context.stats().channels_created, 2);
    session.close();
}

#[test]
fn test_close() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    context.add_pv("A", 1i32).unwrap();
    context.add_pv("B", 2i32).unwrap();
    session.read_many(["A", "B"]).unwrap();
    assert_eq!(context.stats().channels_open(), 2);

    session.close();
    session.close();
    assert!(session.is_closed());
    assert_eq!(context.stats().channels_open(), 0);
    assert!(context.is_disposed());
    assert_eq!(session.read("A").unwrap_err(), Error::SessionClosed);
}

#[test]
fn test_drop_closes() {
    let (context, session) = loopback_session(Duration::from_secs(2));
    context.add_pv("A", 1i32).unwrap();
    session.read("A").unwrap();
    drop(session);
    assert_eq!(context.stats().channels_open(), 0);
    assert!(context.is_disposed());
}
