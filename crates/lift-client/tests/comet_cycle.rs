mod common;

use common::{page, quiet_config, settle, started};
use lift_client::{AjaxRequest, ClientConfig, TransportError, WatchSet};
use lift_client_testing::HookEvent;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

fn channels(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[tokio::test(start_paused = true)]
async fn initial_channels_poll_immediately() -> anyhow::Result<()> {
    let start = Instant::now();
    let mut h = started(quiet_config(), page().with_channel("A", 1));

    let poll = h.server.next_poll().await?;
    assert_eq!(Instant::now(), start);
    assert_eq!(poll.request.watch, channels(&[("A", 1)]));
    assert_eq!(poll.request.timeout, Duration::from_secs(140));

    let parts: Vec<&str> = poll.request.url.split('/').collect();
    assert_eq!(parts[..3], ["", "lift", "comet"]);
    assert_eq!(parts[4..], ["S1", "F1"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn nothing_to_watch_means_no_poll() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.server.try_next_poll().is_none());
    assert!(!h.client.comet_cycle().is_polling());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn back_to_back_restarts_issue_one_poll() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page());

    h.client.register_channels(channels(&[("A", 1)]), true);
    h.client.register_channels(channels(&[("B", 2)]), true);

    let poll = h.server.next_poll().await?;
    assert_eq!(poll.request.watch, channels(&[("A", 1), ("B", 2)]));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.server.try_next_poll().is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restart_aborts_the_outstanding_poll() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page().with_channel("A", 1));
    let first = h.server.next_poll().await?;

    h.client.register_channels(channels(&[("B", 2)]), true);
    let second = h.server.next_poll().await?;
    settle().await;

    assert!(first.is_aborted());
    assert!(!second.is_aborted());
    assert_eq!(second.request.watch, channels(&[("A", 1), ("B", 2)]));

    // Only one poll is live.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.server.try_next_poll().is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn registering_without_restart_waits_for_next_cycle() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page().with_channel("A", 1));
    let first = h.server.next_poll().await?;

    h.client.register_channels(channels(&[("B", 2)]), false);
    settle().await;
    assert!(!first.is_aborted());
    assert!(h.server.try_next_poll().is_none());

    first.succeed("");
    let next = h.server.next_poll().await?;
    assert_eq!(next.request.watch, channels(&[("A", 1), ("B", 2)]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn success_rearms_after_settle_delay() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page().with_channel("A", 1));

    h.server.next_poll().await?.succeed("{}");
    let answered = Instant::now();

    h.server.next_poll().await?;
    assert_eq!(Instant::now() - answered, Duration::from_millis(100));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failure_rearms_after_retry_interval() -> anyhow::Result<()> {
    let config = ClientConfig {
        long_poll_retry_interval: Duration::from_secs(3),
        ..quiet_config()
    };
    let mut h = started(config, page().with_channel("A", 1));

    h.server
        .next_poll()
        .await?
        .fail(TransportError::Status(502));
    let failed = Instant::now();

    let retry = h.server.next_poll().await?;
    assert_eq!(Instant::now() - failed, Duration::from_secs(3));
    assert_eq!(retry.request.watch, channels(&[("A", 1)]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn versions_from_the_server_update_watched_channels() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page().with_channel("A", 1));

    h.server
        .next_poll()
        .await?
        .succeed(r#"{"versions": {"A": 7, "Z": 3}}"#);

    let next = h.server.next_poll().await?;
    assert_eq!(next.request.watch, channels(&[("A", 7)]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn comets_from_the_server_restart_at_once() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page().with_channel("A", 1));

    h.server
        .next_poll()
        .await?
        .succeed(r#"{"comets": {"C": 0}}"#);
    let answered = Instant::now();

    let next = h.server.next_poll().await?;
    assert_eq!(Instant::now(), answered);
    assert_eq!(next.request.watch, channels(&[("A", 1), ("C", 0)]));

    // The settle-delay entry armed by the same answer is stale.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.server.try_next_poll().is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn session_loss_is_reported_and_retried() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page().with_channel("A", 1));

    h.server
        .next_poll()
        .await?
        .succeed(r#"{"sessionLost": true}"#);
    let lost = Instant::now();

    h.server.next_poll().await?;
    assert_eq!(Instant::now() - lost, Duration::from_secs(10));
    assert_eq!(h.hooks.count(&HookEvent::CometSessionLost), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn malformed_answer_goes_to_error_hook() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page().with_channel("A", 1));

    h.server.next_poll().await?.succeed("not json");
    h.server.next_poll().await?;

    let errors: Vec<_> = h
        .hooks
        .events()
        .into_iter()
        .filter(|e| matches!(e, HookEvent::CometError(_)))
        .collect();
    assert_eq!(errors.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn emptied_watch_set_stops_polling() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page().with_channel("A", 1));
    let poll = h.server.next_poll().await?;

    assert!(h.client.unregister_channel("A"));
    poll.succeed("");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.server.try_next_poll().is_none());

    // Watching again needs a restart to wake the idle cycle.
    h.client
        .replace_watch_set(WatchSet::from(channels(&[("B", 4)])));
    h.client.comet_cycle().restart();
    assert_eq!(h.server.next_poll().await?.request.watch, channels(&[("B", 4)]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn alternate_origin_prefixes_poll_url() -> anyhow::Result<()> {
    let config = ClientConfig {
        alternate_server_origin: Some("https://push.example.com".into()),
        ..quiet_config()
    };
    let mut h = started(config, page().with_channel("A", 1));

    let poll = h.server.next_poll().await?;
    assert!(poll.request.url.starts_with("https://push.example.com/lift/comet/"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_and_stays_quiet() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page().with_channel("A", 1));
    let poll = h.server.next_poll().await?;

    h.client.shutdown();
    settle().await;
    assert!(poll.is_aborted());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.server.try_next_poll().is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn long_poll_discards_unclaimed_uri_suffix() -> anyhow::Result<()> {
    let mut h = started(quiet_config(), page());

    h.client.set_uri_suffix("extra=1");
    h.client.register_channels(channels(&[("A", 1)]), true);
    h.server.next_poll().await?;

    h.client.ajax(AjaxRequest::new("a=1"));
    assert_eq!(h.server.next_post().await?.request.payload, "a=1");
    Ok(())
}
