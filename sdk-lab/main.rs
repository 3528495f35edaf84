//! Rollgate Rust SDK Lab
//!
//! Offline verification of the evaluation and resilience building blocks.
//! Run with: cargo run --example sdk-lab

use rollgate::evaluation::RulesPayload;
use rollgate::{
    is_in_rollout, CacheConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState, ErrorCode,
    FlagCache, LocalEvaluator, RetryConfig, RollgateError, RollgateOptions, UserContext,
};
use std::collections::HashMap;
use std::time::Duration;

const PASS: &str = "\x1b[32m[PASS]\x1b[0m";
const FAIL: &str = "\x1b[31m[FAIL]\x1b[0m";

#[tokio::main]
async fn main() {
    println!("=== Rollgate Rust SDK Lab ===\n");

    let mut passed = 0;
    let mut failed = 0;

    macro_rules! check {
        ($cond:expr, $test:expr) => {{
            if $cond {
                println!("{} {}", PASS, $test);
                passed += 1;
            } else {
                println!("{} {}", FAIL, $test);
                failed += 1;
            }
        }};
    }

    println!("Testing options...");
    check!(RollgateOptions::new("lab_key").validate().is_ok(), "Valid options");
    check!(
        RollgateOptions::new("").validate().is_err(),
        "Empty API key rejected"
    );

    println!("\nTesting rollout hashing...");
    check!(is_in_rollout("new-feature", "user-123", 60), "new-feature/user-123 in 60%");
    check!(!is_in_rollout("dark-mode", "alice", 50), "dark-mode/alice out of 50%");
    let enabled = (0..1000)
        .filter(|i| is_in_rollout("lab-spread", &format!("user-{}", i), 25))
        .count();
    check!(
        (180..=320).contains(&enabled),
        format!("25% rollout distribution ({} of 1000)", enabled)
    );

    println!("\nTesting local evaluation...");
    let payload: Result<RulesPayload, _> = serde_json::from_value(serde_json::json!({
        "version": "lab-1",
        "flags": {
            "lab-beta": {
                "key": "lab-beta",
                "enabled": true,
                "rollout": 0,
                "targetUsers": ["lab-vip"],
                "rules": [{
                    "id": "premium",
                    "enabled": true,
                    "rollout": 100,
                    "conditions": [{"attribute": "plan", "operator": "in", "value": "premium,enterprise"}]
                }]
            }
        }
    }));
    match payload {
        Ok(payload) => {
            let evaluator = LocalEvaluator::new();
            evaluator.set_rules(payload);
            check!(
                evaluator.evaluate("lab-beta", Some(&UserContext::new("lab-vip")), false),
                "Target user enabled"
            );
            let premium = UserContext::new("lab-user").attribute("plan", "premium");
            check!(
                evaluator.evaluate("lab-beta", Some(&premium), false),
                "Rule match enabled"
            );
            check!(
                !evaluator.evaluate("lab-beta", Some(&UserContext::new("lab-user")), false),
                "Fallthrough disabled"
            );
            check!(
                evaluator.evaluate("missing", None, true),
                "Default value for missing flag"
            );
        }
        Err(e) => check!(false, format!("Rules payload - {}", e)),
    }

    println!("\nTesting cache...");
    let cache = FlagCache::new(CacheConfig::default());
    check!(cache.get().is_none(), "Empty cache misses");
    cache.set(HashMap::from([("lab-bool".to_string(), true)]));
    match cache.get() {
        Some(cached) => check!(
            !cached.stale && cached.flags.get("lab-bool") == Some(&true),
            "Fresh cache hit"
        ),
        None => check!(false, "Fresh cache hit"),
    }

    println!("\nTesting circuit breaker...");
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 2,
        recovery_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    for _ in 0..2 {
        let _ = breaker
            .execute(|| async {
                Err::<(), _>(RollgateError::new(ErrorCode::NetworkError, "lab failure"))
            })
            .await;
    }
    check!(breaker.state() == CircuitState::Open, "Opens after failures");
    let rejected = breaker.execute(|| async { Ok(()) }).await;
    check!(
        rejected.is_err_and(|e| e.is_circuit_open()),
        "Rejects while open"
    );
    tokio::time::sleep(Duration::from_millis(60)).await;
    let recovered = breaker.execute(|| async { Ok(()) }).await;
    check!(recovered.is_ok(), "Probe allowed after recovery timeout");

    println!("\nTesting retry backoff...");
    let retry = RetryConfig::builder().jitter_factor(0.0).build();
    check!(
        retry.calculate_backoff(0) == Duration::from_millis(100)
            && retry.calculate_backoff(1) == Duration::from_millis(200),
        "Exponential backoff"
    );
    check!(
        retry.calculate_backoff(20) == retry.max_delay,
        "Backoff capped at max delay"
    );

    print_summary(passed, failed);

    if failed > 0 {
        println!("\n\x1b[31mSome verifications failed!\x1b[0m");
        std::process::exit(1);
    } else {
        println!("\n\x1b[32mAll verifications passed!\x1b[0m");
        std::process::exit(0);
    }
}

fn print_summary(passed: i32, failed: i32) {
    println!("\n{}", "=".repeat(40));
    println!("Results: {} passed, {} failed", passed, failed);
    println!("{}", "=".repeat(40));
}
