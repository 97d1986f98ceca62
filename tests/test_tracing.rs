//! TracingDriver diagnostics: provenance capture, error augmentation, and
//! the live-callback dump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use eddy::{Driver, LoopError, TracingDriver};

#[test]
fn test_enable_after_cancel_carries_both_traces() {
    let driver = TracingDriver::new(Driver::select());

    let id = driver.defer(|_| Ok(()));
    driver.cancel(id);

    match driver.enable(id).unwrap_err() {
        LoopError::InvalidCallback {
            id: failed,
            creation_trace,
            cancellation_trace,
        } => {
            assert_eq!(failed, id);
            assert!(creation_trace.is_some(), "creation trace missing");
            assert!(cancellation_trace.is_some(), "cancellation trace missing");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_dump_lists_live_callbacks_and_forgets_cancelled_ones() {
    let driver = TracingDriver::new(Driver::select());

    let id = driver.repeat(10.0, |_| Ok(()));
    let header = format!("Callback identifier: {id}");
    assert!(driver.dump().contains(&header));

    driver.cancel(id);
    assert!(!driver.dump().contains(&header));
}

#[test]
fn test_dump_skips_disabled_and_unreferenced_callbacks() {
    let driver = TracingDriver::new(Driver::select());

    let disabled = driver.repeat(10.0, |_| Ok(()));
    let unreferenced = driver.repeat(10.0, |_| Ok(()));
    let live = driver.repeat(10.0, |_| Ok(()));
    driver.disable(disabled).unwrap();
    driver.unreference(unreferenced).unwrap();

    let dump = driver.dump();
    assert!(!dump.contains(&format!("Callback identifier: {disabled}")));
    assert!(!dump.contains(&format!("Callback identifier: {unreferenced}")));
    assert!(dump.contains(&format!("Callback identifier: {live}")));

    driver.enable(disabled).unwrap();
    driver.reference(unreferenced).unwrap();
    let dump = driver.dump();
    assert!(dump.contains(&format!("Callback identifier: {disabled}")));
    assert!(dump.contains(&format!("Callback identifier: {unreferenced}")));
}

#[test]
fn test_one_shot_invocations_leave_the_dump() {
    let driver = TracingDriver::new(Driver::select());
    let ran = Arc::new(AtomicBool::new(false));

    let sink = ran.clone();
    let id = driver.defer(move |_| {
        sink.store(true, Ordering::SeqCst);
        Ok(())
    });
    driver.run().unwrap();

    assert!(ran.load(Ordering::SeqCst));
    assert!(!driver.dump().contains(&format!("Callback identifier: {id}")));
    // The id stopped resolving the moment the callback ran; the failure
    // still carries the creation trace.
    match driver.enable(id).unwrap_err() {
        LoopError::InvalidCallback { creation_trace, .. } => {
            assert!(creation_trace.is_some());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_tracing_driver_passes_work_through() {
    let driver = TracingDriver::new(Driver::select());
    let order = Arc::new(Mutex::new(Vec::new()));

    let timed = order.clone();
    driver.delay(0.01, move |_| {
        timed.lock().unwrap().push("timer");
        Ok(())
    });
    let queued = order.clone();
    driver.queue(move || {
        queued.lock().unwrap().push("microtask");
        Ok(())
    });

    driver.run().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["microtask", "timer"]);
}
