//! A successor that never declares readiness is killed after the
//! configured timeout and the current generation keeps serving.

use std::{
    env, process, thread,
    time::{Duration, Instant},
};

use instar::{Options, UpgradeError, Upgrader};

#[test]
fn upgrade_times_out_when_the_successor_never_readies() {
    if env::var_os("TABLEFLIP_HAS_PARENT_7DIU3").is_some() {
        // Successor mode: no ready(), just wait for the SIGKILL.
        thread::sleep(Duration::from_secs(60));
        process::exit(1);
    }

    let upgrader = Upgrader::new(Options {
        upgrade_timeout: Duration::from_secs(2),
        ..Options::default()
    })
    .unwrap();
    upgrader.ready().unwrap();

    let started = Instant::now();
    let err = upgrader.upgrade().expect_err("successor never readied");
    let elapsed = started.elapsed();

    assert!(matches!(err, UpgradeError::TimedOut(_)), "got: {err}");
    assert!(elapsed >= Duration::from_secs(2), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "returned after {elapsed:?}");

    // The failure is non-fatal: no exit signal, and the state machine
    // accepts another attempt (which times out the same way).
    assert!(!upgrader.exit().wait_timeout(Duration::from_millis(100)));
    let err = upgrader.upgrade().expect_err("second attempt, same successor");
    assert!(matches!(err, UpgradeError::TimedOut(_)), "got: {err}");
}
