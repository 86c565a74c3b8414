//! Integration tests for one run of the bot and the retry loop around it.
//!
//! Tests: startup ordering, teardown ordering after a failing task, owner
//! commands (shutdown, restart, setchannel), quote replies and listings, the
//! mention flow, and retrying.

mod common;

use std::{sync::Arc, time::Duration};

use common::*;
use greta_core::{
    domain::ChatId,
    handlers::NO_ANSWER,
    retry::{run_with_retry, RetryAttempt, RetryPolicy, RunExit},
    runtime::{run_once, RunDeps},
    Error, Result,
};

fn first_attempt() -> RetryAttempt {
    RetryAttempt {
        attempt_number: 1,
        last_error: None,
    }
}

fn spawn_run(deps: Arc<RunDeps>) -> tokio::task::JoinHandle<Result<RunExit>> {
    tokio::spawn(async move { run_once(&deps, first_attempt()).await })
}

/// Storage is ready before the client connects; storage closes after the client stopped.
#[tokio::test]
async fn test_startup_and_teardown_order() {
    let log = EventLog::default();
    let client = FakeChatClient::new(
        log.clone(),
        vec![RunBehavior::FailAfter(Duration::from_millis(50))],
    );
    let store = RecordingStore::new(log.clone());
    let deps = deps(client.clone(), store.clone());

    let err = run_once(&deps, first_attempt()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got {err:?}");

    assert!(position(&log, "client:identity") < position(&log, "store:connect"));
    assert!(position(&log, "store:connect") < position(&log, "store:create_schema"));
    assert!(position(&log, "store:create_schema") < position(&log, "client:run"));
    assert!(position(&log, "client:stopped") < position(&log, "store:close"));
    assert_eq!(entries(&log).last().map(String::as_str), Some("store:close"));
}

/// A shutdown signal waits for the lingering client before storage closes.
#[tokio::test]
async fn test_signal_shutdown_waits_for_every_task() {
    let log = EventLog::default();
    let client = FakeChatClient::new(
        log.clone(),
        vec![RunBehavior::UntilCancelled {
            linger: Duration::from_millis(40),
        }],
    );
    let store = RecordingStore::new(log.clone());
    let deps = deps(client.clone(), store.clone());
    let shutdown = deps.shutdown.clone();
    let run = spawn_run(deps);

    client.connected_hub().await;
    shutdown.cancel();

    let exit = run.await.unwrap().unwrap();
    assert_eq!(exit, RunExit::Shutdown);
    assert!(position(&log, "client:stopped") < position(&log, "store:close"));
    assert_eq!(entries(&log).iter().filter(|e| *e == "store:close").count(), 1);
}

/// Storage failures during startup end the run after teardown; nothing connects.
#[tokio::test]
async fn test_storage_failure_tears_down_without_connecting() {
    let log = EventLog::default();
    let client = FakeChatClient::new(log.clone(), vec![]);
    let store = RecordingStore::failing_connect(log.clone(), Error::Store("locked".into()));
    let deps = deps(client.clone(), store);

    let err = run_once(&deps, first_attempt()).await.unwrap_err();
    assert!(matches!(err, Error::Store(_)));
    assert_eq!(client.runs(), 0);
    assert_eq!(entries(&log).last().map(String::as_str), Some("store:close"));
}

#[tokio::test]
async fn test_owner_commands_end_the_run() {
    for (command, expected) in [("/shutdown", RunExit::Shutdown), ("/restart", RunExit::Restart)] {
        let log = EventLog::default();
        let client = FakeChatClient::new(log.clone(), vec![]);
        let deps = deps(client.clone(), RecordingStore::new(log.clone()));
        let run = spawn_run(deps);

        let hub = client.connected_hub().await;
        hub.dispatch(message(GROUP, 55, command)).await;
        client.wait_for_sent("You are not allowed to do that.").await;

        hub.dispatch(message(GROUP, OWNER, command)).await;
        let exit = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run did not end")
            .unwrap()
            .unwrap();
        assert_eq!(exit, expected, "after {command}");
    }
}

#[tokio::test]
async fn test_quotes_status_and_owner_dm_forwarding() {
    let log = EventLog::default();
    let client = FakeChatClient::new(log.clone(), vec![]);
    let store = RecordingStore::new(log.clone());
    let deps = deps(client.clone(), store.clone());
    let shutdown = deps.shutdown.clone();
    let run = spawn_run(deps);

    let hub = client.connected_hub().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.quote_count() == 0 || client.statuses().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("seeding and first status update");

    hub.dispatch(message(GROUP, 55, ">_>")).await;
    client.wait_for_sent("<_<").await;

    hub.dispatch(message(GROUP, 55, "/addquote \"good bot\" thank you!")).await;
    client.wait_for_sent("I saved the quote.").await;
    hub.dispatch(message(GROUP, 56, "Good Bot")).await;
    client.wait_for_sent("thank you!").await;

    hub.dispatch(message(OWNER, OWNER, "tell everyone hi")).await;
    client.wait_for_sent("tell everyone hi").await;
    assert!(client
        .sent()
        .contains(&(ChatId(-200), "tell everyone hi".to_string())));

    shutdown.cancel();
    assert_eq!(run.await.unwrap().unwrap(), RunExit::Shutdown);
}

/// `setchannel` moves owner DM forwarding to the group it was sent in.
#[tokio::test]
async fn test_setchannel_redirects_owner_dms() {
    let log = EventLog::default();
    let client = FakeChatClient::new(log.clone(), vec![]);
    let deps = deps(client.clone(), RecordingStore::new(log.clone()));
    let shutdown = deps.shutdown.clone();
    let run = spawn_run(deps);

    let hub = client.connected_hub().await;
    hub.dispatch(message(GROUP, 55, "/setchannel")).await;
    client.wait_for_sent("You are not allowed to do that.").await;

    hub.dispatch(message(OWNER, OWNER, "/setchannel")).await;
    client.wait_for_sent("This command only works in group chats.").await;

    hub.dispatch(message(GROUP, OWNER, "/setchannel")).await;
    client.wait_for_sent("Set the default channel to this channel.").await;

    hub.dispatch(message(OWNER, OWNER, "over here now")).await;
    client.wait_for_sent("over here now").await;
    let sent = client.sent();
    assert!(sent.contains(&(ChatId(GROUP), "over here now".to_string())));
    assert!(!sent.contains(&(ChatId(-200), "over here now".to_string())));

    shutdown.cancel();
    assert_eq!(run.await.unwrap().unwrap(), RunExit::Shutdown);
}

#[tokio::test]
async fn test_listquotes_shows_only_this_chats_keywords() {
    let log = EventLog::default();
    let client = FakeChatClient::new(log.clone(), vec![]);
    let deps = deps(client.clone(), RecordingStore::new(log.clone()));
    let shutdown = deps.shutdown.clone();
    let run = spawn_run(deps);

    let hub = client.connected_hub().await;
    hub.dispatch(message(GROUP, 55, "/listquotes")).await;
    client.wait_for_sent("I couldn't find any quotes in this chat.").await;

    hub.dispatch(message(GROUP, 55, "/addquote oof big oof")).await;
    client.wait_for_sent("I saved the quote.").await;
    hub.dispatch(message(-300, 55, "/addquote \"elsewhere\" not listed")).await;
    hub.dispatch(message(GROUP, 55, "/addquote \"hello there\" General Kenobi")).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while client
            .sent_texts()
            .iter()
            .filter(|t| *t == "I saved the quote.")
            .count()
            < 3
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("quotes saved");

    hub.dispatch(message(GROUP, 55, "/listquotes")).await;
    client.wait_for_sent("oof; hello there").await;
    assert!(!client.sent_texts().iter().any(|t| t.contains("elsewhere")));

    hub.dispatch(message(55, 55, "/listquotes")).await;
    client.wait_for_sent("This command only works in group chats.").await;

    shutdown.cancel();
    assert_eq!(run.await.unwrap().unwrap(), RunExit::Shutdown);
}

#[tokio::test]
async fn test_mention_asks_and_waits_for_an_answer() {
    let log = EventLog::default();
    let client = FakeChatClient::new(log.clone(), vec![]);
    let deps = deps(client.clone(), RecordingStore::new(log.clone()));
    let shutdown = deps.shutdown.clone();
    let run = spawn_run(deps);

    let hub = client.connected_hub().await;
    hub.dispatch(message(GROUP, 55, &format!("hey @{BOT_NAME}"))).await;
    client.wait_for_sent("Can I help you with anything?").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.pending_waits() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("mention flow never started waiting");

    // Another user's answer does not count.
    hub.dispatch(message(GROUP, 56, "no")).await;
    hub.dispatch(message(GROUP, 55, "yes")).await;
    client.wait_for_sent("use the /help command").await;
    assert!(!client.sent_texts().iter().any(|t| t.contains("don't ping me")));

    shutdown.cancel();
    assert_eq!(run.await.unwrap().unwrap(), RunExit::Shutdown);
}

/// An unanswered mention gets exactly one explanation and leaves no waiter behind.
#[tokio::test]
async fn test_unanswered_mention_explains_once() {
    let log = EventLog::default();
    let client = FakeChatClient::new(log.clone(), vec![]);
    let deps = deps(client.clone(), RecordingStore::new(log.clone()));
    let shutdown = deps.shutdown.clone();
    let run = spawn_run(deps);

    let hub = client.connected_hub().await;
    hub.dispatch(message(GROUP, 55, &format!("@{BOT_NAME} hi"))).await;
    client.wait_for_sent(NO_ANSWER).await;

    let explained = client.sent_texts().iter().filter(|t| *t == NO_ANSWER).count();
    assert_eq!(explained, 1);
    assert_eq!(hub.pending_waits(), 0);

    shutdown.cancel();
    assert_eq!(run.await.unwrap().unwrap(), RunExit::Shutdown);
}

/// Two lost connections are retried, the third run is shut down cleanly.
#[tokio::test]
async fn test_retry_loop_restarts_after_transport_failures() {
    let log = EventLog::default();
    let client = FakeChatClient::new(
        log.clone(),
        vec![
            RunBehavior::FailAfter(Duration::from_millis(10)),
            RunBehavior::FailAfter(Duration::from_millis(10)),
        ],
    );
    let deps = deps(client.clone(), RecordingStore::new(log.clone()));
    let shutdown = deps.shutdown.clone();

    let watcher = client.clone();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        while watcher.runs() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stopper.cancel();
    });

    let policy = RetryPolicy {
        delay: Duration::from_millis(10),
        max_attempts: None,
    };
    let d = deps.clone();
    tokio::time::timeout(
        Duration::from_secs(10),
        run_with_retry(&policy, &shutdown, move |attempt| {
            let d = d.clone();
            async move { run_once(&d, attempt).await }
        }),
    )
    .await
    .expect("retry loop did not finish")
    .unwrap();

    assert_eq!(client.runs(), 3);
    let closes = entries(&log).iter().filter(|e| *e == "store:close").count();
    assert_eq!(closes, 3);
}

#[tokio::test]
async fn test_rejected_credentials_are_not_retried() {
    let log = EventLog::default();
    let client = FakeChatClient::rejecting_credentials(log.clone());
    let deps = deps(client.clone(), RecordingStore::new(log.clone()));
    let shutdown = deps.shutdown.clone();

    let d = deps.clone();
    let err = run_with_retry(&RetryPolicy::default(), &shutdown, move |attempt| {
        let d = d.clone();
        async move { run_once(&d, attempt).await }
    })
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Auth(_)));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(
        entries(&log).iter().filter(|e| *e == "client:identity").count(),
        1
    );
    assert!(!entries(&log).contains(&"store:connect".to_string()));
}
