//! Runs a small pool end to end.
//!
//! ```text
//! RUST_LOG=rttp_pool=debug cargo run --example pool_demo
//! ```
//!
//! Settings can be overridden through the environment, e.g.
//! `RTTP_POOL_SIZE=4 RTTP_POOL_RESPAWN=retire`.

use std::time::Duration;

use rttp_pool::{Pool, PoolConfig, PoolEvent};

/// Simulated work: sleeps for `ms`, fails on 0, panics on 13.
async fn work(ms: u64) -> Result<u64, String> {
    match ms {
        0 => Err("refusing to do zero work".to_string()),
        13 => panic!("unlucky job"),
        ms => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms * 2)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rttp_pool=info")),
        )
        .init();

    let config = PoolConfig::from_env()?.with_size(2);
    let pool: Pool<u64, u64> = Pool::builder(work)
        .config(config)
        .validator(|ms: &u64| {
            if *ms > 5_000 {
                Err(format!("{ms}ms is over the 5s job limit"))
            } else {
                Ok(())
            }
        })
        .build()?;

    let mut events = pool.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let closed = matches!(event, PoolEvent::Closed { .. });
            println!("event  {}", serde_json::to_string(&event).unwrap_or_default());
            if closed {
                break;
            }
        }
    });

    let mut handles = Vec::new();
    for ms in [120, 80, 0, 13, 40, 60] {
        handles.push(pool.schedule(ms)?);
    }
    if let Err(e) = pool.schedule(10_000) {
        println!("rejected  {e}");
    }
    println!("stats  {:?}", pool.stats());

    for handle in handles {
        let id = handle.id();
        match handle.await {
            Ok(value) => println!("{id}  ok {value}"),
            Err(e) => println!("{id}  {e}"),
        }
    }
    println!("stats  {:?}", pool.stats());

    let slow = pool.schedule(2_000)?;
    let report = pool.shutdown(Duration::from_millis(200)).await?;
    println!("forced  {:?}", report.forced_task_ids);
    let id = slow.id();
    match slow.await {
        Ok(value) => println!("{id}  ok {value}"),
        Err(e) => println!("{id}  {e}"),
    }

    printer.await?;
    Ok(())
}
