use mcp_link::bridge::{DrainOutcome, WorkBridge};
use mcp_link::tools::ToolResult;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[test]
fn every_submitter_gets_its_own_result() {
    let bridge = Arc::new(WorkBridge::new(5));
    let submitters: Vec<_> = (0..12)
        .map(|n| {
            let bridge = bridge.clone();
            std::thread::spawn(move || {
                let result = bridge
                    .submit(json!({"n": n}), Duration::from_secs(10))
                    .unwrap();
                (n, result)
            })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut executed = 0;
    while executed < 12 {
        assert!(Instant::now() < deadline, "only {executed} items ran");
        if let DrainOutcome::Drained(n) =
            bridge.drain(|payload| Ok(ToolResult::text(format!("done {}", payload["n"]))))
        {
            assert!(n <= 5);
            executed += n;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    for submitter in submitters {
        let (n, result) = submitter.join().unwrap();
        assert_eq!(result.first_text(), Some(format!("done {n}").as_str()));
    }
}

#[test]
fn concurrent_ticks_never_overlap() {
    let bridge = Arc::new(WorkBridge::new(5));
    let tickets: Vec<_> = (0..40).map(|n| bridge.enqueue(json!(n))).collect();
    let inside = Arc::new(AtomicUsize::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    let tickers: Vec<_> = (0..4)
        .map(|_| {
            let bridge = bridge.clone();
            let inside = inside.clone();
            let ran = ran.clone();
            std::thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(10);
                while ran.load(Ordering::SeqCst) < 40 && Instant::now() < deadline {
                    bridge.drain(|payload| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::sleep(Duration::from_micros(200));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(ToolResult::text(payload.to_string()))
                    });
                }
            })
        })
        .collect();
    for ticker in tickers {
        ticker.join().unwrap();
    }

    assert_eq!(ran.load(Ordering::SeqCst), 40);
    for (n, ticket) in tickets.into_iter().enumerate() {
        let result = ticket.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(result.first_text(), Some(n.to_string().as_str()));
    }
}
