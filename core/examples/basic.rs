//! Basic circuit breaker usage example

use rate_breaker::{CallOptions, CircuitBreaker, FallbackReason, Registry, State};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    println!("=== Circuit Breaker Basic Example ===\n");

    // Create a circuit with builder API
    let circuit = CircuitBreaker::builder("payment_api")
        .sliding_window_size(4)
        .minimum_number_of_calls(3)
        .failure_rate_threshold(50.0)
        .wait_duration_in_open_state(Duration::from_millis(200))
        .permitted_calls_in_half_open_state(2)
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .build()
        .expect("valid circuit configuration");

    println!("Initial state: {}\n", circuit.current_state());

    // Simulate successful calls
    println!("--- Successful calls ---");
    for i in 1..=2 {
        match circuit.call(move || Ok::<_, String>(format!("Payment {}", i))) {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ Error: {}", e),
        }
    }
    println!("State: {}\n", circuit.current_state());

    // Simulate failures
    println!("--- Triggering failures ---");
    for i in 1..=2 {
        match circuit.call(move || Err::<String, _>(format!("Payment failed {}", i))) {
            Ok(_) => println!("✓ Success"),
            Err(e) => println!("✗ {}", e),
        }
    }
    println!("State: {} (circuit opened)\n", circuit.current_state());

    // Try calling while open, with a fallback
    println!("--- Attempting call while open ---");
    let result = circuit.call((
        || Ok::<_, String>("Should be rejected".to_string()),
        CallOptions::new().with_fallback(|ctx| match ctx.reason {
            FallbackReason::NotPermitted => Ok(format!("cached response ({})", ctx.state)),
            FallbackReason::Failed(e) => Err(e),
        }),
    ));
    println!("→ {:?}", result.map_err(|e| e.to_string()));
    println!("Metrics: {:?}\n", circuit.metrics_snapshot());

    // Wait out the open state and probe
    println!("--- Recovering through half-open ---");
    std::thread::sleep(Duration::from_millis(250));
    for _ in 0..2 {
        let _ = circuit.call(|| Ok::<_, String>("probe ok"));
    }
    assert_eq!(circuit.current_state(), State::Closed);
    println!("State: {}\n", circuit.current_state());

    // Registry of named circuits
    println!("--- Registry ---");
    let registry = Registry::new(rate_breaker::Config::default()).expect("valid default config");
    registry.get("inventory").force_open();
    registry.get("shipping");
    for report in registry.reset_all() {
        println!("{}: {} -> {}", report.name, report.previous, report.current);
    }
}
