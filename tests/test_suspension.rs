//! Suspension semantics: parking fibers and the loop-owning thread,
//! microtask-mediated resumption, and misuse failures.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eddy::{Driver, Fiber};

#[test]
fn test_fiber_resumed_from_a_timer_wakes_on_the_next_microtask_drain() {
    let driver = Driver::select();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (handoff, suspension_rx) = mpsc::channel();

    let fiber_driver = driver.clone();
    let fiber_order = order.clone();
    Fiber::spawn(move || {
        let suspension = fiber_driver.create_suspension::<i32>();
        handoff.send(suspension.clone()).unwrap();
        let value = suspension.suspend().unwrap();
        assert_eq!(value, 42);
        fiber_order.lock().unwrap().push("fiber-woke");
    });

    let suspension = suspension_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("fiber never handed its suspension over");
    let resume_order = order.clone();
    driver.delay(0.02, move |_| {
        suspension.resume(42).unwrap();
        // The resumer keeps running; the fiber wakes only on the next
        // microtask drain.
        resume_order.lock().unwrap().push("resume-returned");
        Ok(())
    });

    driver.run().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["resume-returned", "fiber-woke"]);
}

#[test]
fn test_fiber_suspension_wakes_on_signal_delivery() {
    let driver = Driver::select();
    let result = Arc::new(Mutex::new(None));
    let (registered, registered_rx) = mpsc::channel();

    let fiber_driver = driver.clone();
    let out = result.clone();
    Fiber::spawn(move || {
        let suspension = fiber_driver.create_suspension::<i32>();
        let resumer = suspension.clone();
        let canceller = fiber_driver.clone();
        fiber_driver
            .on_signal(libc::SIGUSR1, move |id, signo| {
                resumer.resume(signo).unwrap();
                canceller.cancel(id);
                Ok(())
            })
            .unwrap();
        registered.send(()).unwrap();
        let value = suspension.suspend().unwrap();
        *out.lock().unwrap() = Some(value);
    });

    registered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("fiber never registered its signal callback");
    driver.delay(0.02, |_| {
        signal_hook::low_level::raise(libc::SIGUSR1).unwrap();
        Ok(())
    });

    driver.run().unwrap();
    assert_eq!(*result.lock().unwrap(), Some(libc::SIGUSR1));
}

#[test]
fn test_loop_owner_suspension_drives_the_loop_inline() {
    let driver = Driver::select();
    let suspension = driver.create_suspension::<&'static str>();

    let resumer = suspension.clone();
    driver.delay(0.02, move |_| {
        resumer.resume("hello").unwrap();
        Ok(())
    });

    assert_eq!(suspension.suspend().unwrap(), "hello");
    assert!(!driver.is_running());
}

#[test]
fn test_thrown_errors_propagate_out_of_suspend() {
    let driver = Driver::select();
    let suspension = driver.create_suspension::<()>();

    let thrower = suspension.clone();
    driver.delay(0.02, move |_| {
        thrower.throw("denied".into()).unwrap();
        Ok(())
    });

    let error = suspension.suspend().unwrap_err();
    assert_eq!(error.to_string(), "denied");
}

#[test]
fn test_suspensions_are_reusable_after_a_resumption() {
    let driver = Driver::select();
    let suspension = driver.create_suspension::<u32>();

    for round in 1..=3u32 {
        let resumer = suspension.clone();
        driver.delay(0.01, move |_| {
            resumer.resume(round).unwrap();
            Ok(())
        });
        assert_eq!(suspension.suspend().unwrap(), round);
    }
}

#[test]
fn test_double_resume_fails() {
    let driver = Driver::select();
    let suspension = driver.create_suspension::<i32>();

    suspension.resume(1).unwrap();
    assert!(suspension.resume(2).is_err());
    assert!(suspension.throw("late".into()).is_err());
}

#[test]
fn test_suspending_the_scheduler_context_fails() {
    let driver = Driver::select();
    let observed = Arc::new(Mutex::new(None));

    let handle = driver.clone();
    let sink = observed.clone();
    driver.defer(move |_| {
        let suspension = handle.create_suspension::<()>();
        *sink.lock().unwrap() = Some(suspension.suspend().unwrap_err().to_string());
        Ok(())
    });

    driver.run().unwrap();
    let message = observed.lock().unwrap().clone().expect("callback never ran");
    assert!(message.contains("scheduler"), "unexpected error: {message}");
}

#[test]
fn test_suspend_fails_on_a_foreign_thread() {
    let driver = Driver::select();
    let suspension = driver.create_suspension::<()>();

    let foreign = suspension.clone();
    let error = thread::spawn(move || foreign.suspend().unwrap_err().to_string())
        .join()
        .unwrap();
    assert!(error.contains("thread"), "unexpected error: {error}");
}

#[test]
fn test_loop_exit_without_resumption_is_an_error() {
    let driver = Driver::select();
    let suspension = driver.create_suspension::<()>();
    driver.delay(0.01, |_| Ok(()));

    let started = Instant::now();
    let error = suspension.suspend().unwrap_err();
    assert!(
        error.to_string().contains("terminated without resuming"),
        "unexpected error: {error}"
    );
    assert!(started.elapsed().as_secs_f64() < 1.0);
}

#[test]
fn test_resume_before_suspend_is_consumed_by_the_next_suspend() {
    let driver = Driver::select();
    let suspension = driver.create_suspension::<i32>();

    suspension.resume(7).unwrap();
    // Nothing else keeps the loop alive; the queued delivery alone must be
    // enough for the inline suspend to observe the value.
    assert_eq!(suspension.suspend().unwrap(), 7);
}
