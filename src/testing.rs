//! Test support for async code.
//!
//! `embassy_time::Timer` only works under the embassy executor, so async
//! tests run on their own leaked `Executor` thread and hand the result back
//! over a std channel.

use embassy_executor::Executor;
use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

type TestFuture = Pin<Box<dyn Future<Output = ()>>>;

#[embassy_executor::task(pool_size = 16)]
async fn test_task(test: TestFuture) {
    test.await
}

/// Run the future built by `make` on a fresh executor thread and return its
/// output. Panics when it does not finish within `timeout`.
pub fn run_async<T, F>(timeout: Duration, make: impl FnOnce() -> F + Send + 'static) -> T
where
    T: Send + 'static,
    F: Future<Output = T> + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("test-executor".to_string())
        .spawn(move || {
            // INTENTIONAL LEAK: Executor::run requires 'static and never returns.
            let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
            executor.run(move |spawner| {
                let future = make();
                let test: TestFuture = Box::pin(async move {
                    let _ = tx.send(future.await);
                });
                spawner.spawn(test_task(test)).expect("test task pool exhausted");
            });
        })
        .expect("failed to spawn test executor thread");
    rx.recv_timeout(timeout).expect("async test did not finish in time")
}
