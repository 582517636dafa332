use std::time::Duration;

use futures::StreamExt;
use pagekeeper_service::download::{CircuitState, FetchError, FetchEvent, FetchOutcome};
use tokio_util::sync::CancellationToken;

use crate::{HitCounter, setup_services, tempdir};

#[tokio::test]
async fn test_fetch_document() {
    let (services, telemetry, cache_dir) = setup_services(|_| {});
    let files = tempdir();
    std::fs::write(files.path().join("manual.pdf"), b"%PDF-1.7 manual").unwrap();
    let server = HitCounter::new(files.path());
    let destination = cache_dir.path().join("downloads/manual.pdf");

    let events: Vec<_> = services
        .downloader
        .fetch(
            server.url("files/manual.pdf"),
            destination.clone(),
            false,
            CancellationToken::new(),
        )
        .collect()
        .await;

    assert_eq!(events.last(), Some(&FetchEvent::Success(destination.clone())));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(std::fs::read(&destination).unwrap(), b"%PDF-1.7 manual");
    assert_eq!(server.accesses(), 1);
    assert!(telemetry.messages().is_empty());
}

#[tokio::test]
async fn test_failing_origin_is_retried() {
    let (services, telemetry, cache_dir) = setup_services(|_| {});
    let files = tempdir();
    let server = HitCounter::new(files.path());

    let outcome = services
        .downloader
        .fetch(
            server.url("fail/manual.pdf"),
            cache_dir.path().join("manual.pdf"),
            false,
            CancellationToken::new(),
        )
        .outcome()
        .await;

    assert_eq!(
        outcome,
        FetchOutcome::Failure(FetchError::NetworkRetryExhausted {
            attempts: 4,
            last: Box::new(FetchError::Network("500 Internal Server Error".into())),
        })
    );
    assert_eq!(server.accesses(), 4);
    assert_eq!(
        telemetry.messages_in("download"),
        ["download:retry:http:2", "download:retry:http:3", "download:retry:http:4"]
    );
}

#[tokio::test]
async fn test_missing_document_is_not_retried() {
    let (services, _telemetry, cache_dir) = setup_services(|_| {});
    let files = tempdir();
    let server = HitCounter::new(files.path());

    let outcome = services
        .downloader
        .fetch(
            server.url("files/missing.pdf"),
            cache_dir.path().join("missing.pdf"),
            false,
            CancellationToken::new(),
        )
        .outcome()
        .await;

    assert_eq!(outcome, FetchOutcome::Failure(FetchError::NotFound));
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_login_page_opens_circuit() {
    let (services, telemetry, cache_dir) = setup_services(|config| {
        config.downloads.circuit_breaker.failure_threshold = 2;
    });
    let files = tempdir();
    let server = HitCounter::new(files.path());
    let fetch = || {
        services
            .downloader
            .fetch(
                server.url("redirect/login"),
                cache_dir.path().join("manual.pdf"),
                false,
                CancellationToken::new(),
            )
            .outcome()
    };

    for _ in 0..2 {
        assert_eq!(
            fetch().await,
            FetchOutcome::Failure(FetchError::Unsafe("potential login page detected".into()))
        );
    }
    assert_eq!(server.accesses(), 2);
    assert_eq!(services.downloader.circuit_breaker().state(), CircuitState::Open);

    let outcome = fetch().await;
    assert!(matches!(
        outcome,
        FetchOutcome::Failure(FetchError::CircuitOpen { .. })
    ));
    assert_eq!(server.accesses(), 0);
    assert_eq!(
        telemetry.messages_in("download"),
        ["download:circuit_open:consecutive_failures"]
    );

    services.downloader.circuit_breaker().reset();
    assert_eq!(server.accesses(), 0);
    fetch().await;
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_slow_origin_times_out() {
    let (services, _telemetry, cache_dir) = setup_services(|config| {
        config.downloads.max_attempts = 2;
        config.downloads.attempt_timeout = Duration::from_millis(100);
    });
    let files = tempdir();
    let server = HitCounter::new(files.path());

    let outcome = services
        .downloader
        .fetch(
            server.url("delay/1h/files/manual.pdf"),
            cache_dir.path().join("manual.pdf"),
            false,
            CancellationToken::new(),
        )
        .outcome()
        .await;

    let FetchOutcome::Failure(error) = outcome else {
        panic!("unexpected outcome: {outcome:?}");
    };
    assert!(error.is_timeout(), "{error}");
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_cancelled_fetch_emits_no_outcome() {
    let (services, _telemetry, cache_dir) = setup_services(|_| {});
    let files = tempdir();
    let server = HitCounter::new(files.path());
    let cancel = CancellationToken::new();

    let stream = services.downloader.fetch(
        server.url("delay/1h/files/manual.pdf"),
        cache_dir.path().join("manual.pdf"),
        false,
        cancel.clone(),
    );
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        }
    });

    let events: Vec<_> = stream.collect().await;

    assert!(events.iter().all(|event| !event.is_terminal()));
    assert_eq!(
        services.downloader.circuit_breaker().consecutive_failures(),
        0
    );
}
