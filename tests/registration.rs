mod common;

use common::tolerance;
use faultline::prelude::*;
use std::sync::{Arc, Barrier};

#[test]
fn duplicate_breaker_names_fail_the_second_call_site() {
    let (ft, _) = tolerance();
    let descriptor =
        PolicyDescriptor::blocking().with_circuit_breaker(CircuitBreakerConfig::default().name("shared"));

    ft.call(&CallSite::new("A", "op"), &descriptor, || Ok(1u8)).unwrap();
    let failure = ft.call(&CallSite::new("B", "op"), &descriptor, || Ok(1u8)).unwrap_err();
    assert!(matches!(
        failure.downcast_ref::<ConfigError>(),
        Some(ConfigError::DuplicateCircuitBreakerName(name)) if name == "shared"
    ));

    // the first call-site keeps working with its cached pipeline
    ft.call(&CallSite::new("A", "op"), &descriptor, || Ok(1u8)).unwrap();
    assert_eq!(ft.circuit_breakers().names(), vec!["shared".to_string()]);
}

#[test]
fn unnamed_breakers_get_unique_names() {
    let (ft, _) = tolerance();
    let descriptor = PolicyDescriptor::blocking().with_circuit_breaker(CircuitBreakerConfig::default());
    for method in ["a", "b", "c"] {
        ft.call(&CallSite::new("Svc", method), &descriptor, || Ok(())).unwrap();
    }
    let names = ft.circuit_breakers().names();
    assert_eq!(names.len(), 3);
    assert!(names.iter().all(|name| ft.circuit_breakers().state(name) == Ok(CircuitState::Closed)));
}

#[test]
fn concurrent_first_calls_register_once() {
    let (ft, _) = tolerance();
    let site = CallSite::new("Svc", "hot");
    let descriptor =
        PolicyDescriptor::blocking().with_circuit_breaker(CircuitBreakerConfig::default().name("hot"));
    let start = Arc::new(Barrier::new(8));

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let (ft, site, descriptor, start) = (ft.clone(), site.clone(), descriptor.clone(), start.clone());
            std::thread::spawn(move || {
                start.wait();
                ft.call(&site, &descriptor, || Ok(()))
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap().unwrap();
    }
    assert_eq!(ft.circuit_breakers().names(), vec!["hot".to_string()]);
}

#[test]
fn same_call_site_used_with_another_model_is_rejected() {
    let (ft, _) = tolerance();
    let site = CallSite::new("Svc", "shape");
    let failure = ft
        .call_handle(&site, &PolicyDescriptor::blocking(), || Ok(Handle::completed(1u8)))
        .wait()
        .unwrap_err();
    assert!(matches!(failure.downcast_ref::<ConfigError>(), Some(ConfigError::ExecutionModelMismatch { .. })));
}
