mod common;

use common::{tolerance, BadRequest, Unavailable};
use faultline::prelude::*;
use faultline::{InvocationTargetError, MethodOrigin};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Quotes {
    currency: &'static str,
}

fn quote_site() -> CallSite {
    CallSite::with_params("Quotes", "price", vec![ParamType::of::<String>()])
}

fn register_quotes(registry: &FallbackRegistry) {
    registry.register_type(
        TypeInfo::new("Quotes").extends("PricingBase").method(MethodRef::new(
            "cached_price",
            vec![ParamType::of::<String>()],
            |quotes: &Quotes, args: &Arguments| -> Result<String, Failure> {
                let sku = args.get::<String>(0).cloned().unwrap_or_default();
                Ok(format!("{sku}: 0.00 {}", quotes.currency))
            },
        )),
    );
    registry.register_type(TypeInfo::new("PricingBase").implements("Priced"));
    registry.register_type(TypeInfo::new("Priced").method(MethodRef::default_method(
        "list_price",
        vec![ParamType::of::<String>()],
        |_target, _args: &Arguments| -> Result<String, Failure> { Ok("list".to_string()) },
    )));
}

fn invocation(sku: &str) -> Option<Invocation> {
    Some(Invocation::new(Arc::new(Quotes { currency: "EUR" }), Arguments::new().with(sku.to_string())))
}

fn failing(calls: &Arc<AtomicUsize>, failure: fn() -> Failure) -> UnitOfWork<String> {
    let calls = calls.clone();
    UnitOfWork::Blocking(Arc::new(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(failure())
    }))
}

fn value(outcome: Outcome<String>) -> Result<String, Failure> {
    match outcome {
        Outcome::Value(result) => result,
        other => panic!("expected a value, got {other:?}"),
    }
}

#[test]
fn method_fallback_receives_the_invocation() {
    let (ft, _) = tolerance();
    register_quotes(ft.fallbacks());
    let descriptor = PolicyDescriptor::blocking()
        .with_retry(RetryConfig::default().max_retries(2))
        .with_fallback(FallbackConfig::method("cached_price").skip_on(ThrowableSet::of::<BadRequest>()));
    let calls = Arc::new(AtomicUsize::new(0));

    let recovered =
        value(ft.dispatch(&quote_site(), &descriptor, invocation("sku-1"), failing(&calls, || Unavailable.into())));
    assert_eq!(recovered.unwrap(), "sku-1: 0.00 EUR");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let skipped =
        value(ft.dispatch(&quote_site(), &descriptor, invocation("sku-2"), failing(&calls, || BadRequest.into())));
    assert!(skipped.unwrap_err().is::<BadRequest>());
}

#[test]
fn default_methods_of_implemented_interfaces_are_found() {
    let registry = FallbackRegistry::new();
    register_quotes(&registry);
    let method = registry.find_method("Quotes", "list_price", &[ParamType::of::<String>()]).unwrap();
    assert_eq!(method.origin(), MethodOrigin::Default);
    assert!(registry.find_method("Quotes", "list_price", &[]).is_none());
}

#[test]
fn fallback_errors_are_unwrapped_once() {
    let (ft, _) = tolerance();
    ft.fallbacks().register_type(TypeInfo::new("Quotes").method(MethodRef::new(
        "cached_price",
        vec![ParamType::of::<String>()],
        |_quotes: &Quotes, _args: &Arguments| -> Result<String, Failure> { Err(BadRequest.into()) },
    )));
    let descriptor = PolicyDescriptor::blocking().with_fallback(FallbackConfig::method("cached_price"));
    let calls = Arc::new(AtomicUsize::new(0));

    let failure = value(ft.dispatch(&quote_site(), &descriptor, invocation("sku"), failing(&calls, || Unavailable.into())))
        .unwrap_err();
    assert!(failure.is::<BadRequest>());
    assert!(!failure.is::<InvocationTargetError>());
}

#[test]
fn missing_fallback_method_is_a_configuration_error() {
    let (ft, _) = tolerance();
    register_quotes(ft.fallbacks());
    let descriptor = PolicyDescriptor::blocking().with_fallback(FallbackConfig::method("no_such_method"));
    let failure = ft.call(&quote_site(), &descriptor, || Ok("live".to_string())).unwrap_err();
    assert!(matches!(
        failure.downcast_ref::<ConfigError>(),
        Some(ConfigError::FallbackMethodNotFound { method, .. }) if method == "no_such_method"
    ));
}

#[test]
fn fallback_return_type_must_match_the_call_site() {
    let (ft, _) = tolerance();
    register_quotes(ft.fallbacks());
    let descriptor = PolicyDescriptor::blocking().with_fallback(FallbackConfig::method("cached_price"));
    let failure = ft.call(&quote_site(), &descriptor, || Ok(1u64)).unwrap_err();
    assert!(matches!(failure.downcast_ref::<ConfigError>(), Some(ConfigError::FallbackReturnType { .. })));
}

#[test]
fn handler_fallback_for_blocking_calls() {
    let (ft, _) = tolerance();
    ft.fallbacks().register_handler("zero", |ctx: &ExecutionContext| -> Result<u32, Failure> {
        assert_eq!(ctx.call_site().method(), "count");
        Ok(0)
    });
    let descriptor = PolicyDescriptor::blocking().with_fallback(FallbackConfig::handler("zero"));
    let count = ft
        .call(&CallSite::new("Inventory", "count"), &descriptor, || -> Result<u32, Failure> {
            Err(Unavailable.into())
        })
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_fallback_for_promises() {
    let (ft, _) = tolerance();
    ft.fallbacks().register_handler("empty", |_ctx: &ExecutionContext| -> Result<Promise<Vec<u8>>, Failure> {
        Ok(Box::pin(async { Ok(Vec::new()) }))
    });
    let descriptor = PolicyDescriptor::promise().with_fallback(FallbackConfig::handler("empty"));
    let bytes = ft
        .call_async(&CallSite::new("Blobs", "read"), &descriptor, || -> Promise<Vec<u8>> {
            Box::pin(async { Err(Unavailable.into()) })
        })
        .await
        .unwrap();
    assert!(bytes.is_empty());
}
