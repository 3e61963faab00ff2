use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tau_moderation::{
    ChatActuator, ChatApiError, ChatUser, GatewayConfig, GatewayOutcome, InboundEvent,
    InboundMessage, MemberJoined, ModerationConfig, ModerationGateway, ModerationScheduler,
    ProfileInspector, WarningRequest,
};
use tau_moderation_store::{
    InMemoryEventLog, InMemoryWarningStore, SqliteModerationStore, WarningStore,
};
use tau_moderation_types::{ChatId, MessageId, ModerationEventKind, UserId, ViolationSet};
use tempfile::tempdir;

const GROUP: ChatId = -1_001_234_567_890;

#[derive(Default)]
struct ScriptedInspector {
    admins: HashSet<UserId>,
    profiles: Mutex<HashMap<UserId, ViolationSet>>,
}

impl ScriptedInspector {
    fn with_admins(admins: &[UserId]) -> Self {
        Self {
            admins: admins.iter().copied().collect(),
            ..Self::default()
        }
    }

    fn script(&self, user_id: UserId, violations: ViolationSet) {
        self.profiles
            .lock()
            .expect("profiles lock")
            .insert(user_id, violations);
    }
}

#[async_trait]
impl ProfileInspector for ScriptedInspector {
    async fn evaluate(
        &self,
        user_id: UserId,
        _chat_id: ChatId,
    ) -> Result<ViolationSet, ChatApiError> {
        if self.admins.contains(&user_id) {
            return Ok(ViolationSet::none());
        }
        Ok(self
            .profiles
            .lock()
            .expect("profiles lock")
            .get(&user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn is_admin(&self, user_id: UserId, _chat_id: ChatId) -> Result<bool, ChatApiError> {
        Ok(self.admins.contains(&user_id))
    }
}

/// Records every side effect; sent messages get ids starting at 42.
#[derive(Default)]
struct RecordingActuator {
    bans: Mutex<Vec<UserId>>,
    sent: Mutex<Vec<String>>,
    deleted: Mutex<Vec<MessageId>>,
}

impl RecordingActuator {
    fn bans(&self) -> Vec<UserId> {
        self.bans.lock().expect("bans lock").clone()
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl ChatActuator for RecordingActuator {
    async fn ban(&self, user_id: UserId, _chat_id: ChatId) -> Result<(), ChatApiError> {
        self.bans.lock().expect("bans lock").push(user_id);
        Ok(())
    }

    async fn send_message(&self, _chat_id: ChatId, text: &str) -> Result<MessageId, ChatApiError> {
        let mut sent = self.sent.lock().expect("sent lock");
        sent.push(text.to_string());
        Ok(41 + sent.len() as MessageId)
    }

    async fn delete_message(
        &self,
        _chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), ChatApiError> {
        self.deleted.lock().expect("deleted lock").push(message_id);
        Ok(())
    }
}

struct Community {
    gateway: ModerationGateway,
    scheduler: ModerationScheduler,
    store: Arc<dyn WarningStore>,
    log: Arc<InMemoryEventLog>,
    inspector: Arc<ScriptedInspector>,
    actuator: Arc<RecordingActuator>,
}

fn community_with(
    config: ModerationConfig,
    store: Arc<dyn WarningStore>,
    inspector: ScriptedInspector,
) -> Community {
    let log = Arc::new(InMemoryEventLog::new());
    let inspector = Arc::new(inspector);
    let actuator = Arc::new(RecordingActuator::default());
    let scheduler = ModerationScheduler::new(
        config,
        store.clone(),
        log.clone(),
        inspector.clone(),
        actuator.clone(),
    );
    let gateway = ModerationGateway::new(
        GatewayConfig { group_id: GROUP },
        scheduler.clone(),
        inspector.clone(),
        actuator.clone(),
    );
    Community {
        gateway,
        scheduler,
        store,
        log,
        inspector,
        actuator,
    }
}

fn community(admins: &[UserId]) -> Community {
    community_with(
        ModerationConfig::default(),
        Arc::new(InMemoryWarningStore::new()),
        ScriptedInspector::with_admins(admins),
    )
}

fn member(user_id: UserId, username: Option<&str>) -> ChatUser {
    ChatUser {
        user_id,
        username: username.map(str::to_string),
        is_bot: false,
    }
}

fn no_photo_no_handle() -> ViolationSet {
    ViolationSet {
        no_photo: true,
        private_photo: false,
        no_handle: true,
    }
}

fn kind_names(kinds: &[ModerationEventKind]) -> Vec<&'static str> {
    kinds.iter().map(|kind| kind.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn join_without_photo_is_kicked_after_grace_period_for_remaining_violation() {
    let c = community(&[]);
    c.inspector.script(1, no_photo_no_handle());

    let outcome = c
        .gateway
        .handle(InboundEvent::MemberJoined(MemberJoined {
            chat_id: GROUP,
            user: member(1, None),
        }))
        .await
        .expect("join handled");
    let GatewayOutcome::Warned {
        challenge_message_id,
        ..
    } = outcome
    else {
        panic!("expected a warning, got {outcome:?}");
    };
    assert_eq!(challenge_message_id, 42);

    tokio::time::sleep(Duration::from_secs(299)).await;
    c.inspector.script(
        1,
        ViolationSet {
            no_photo: true,
            ..ViolationSet::none()
        },
    );
    assert!(c.actuator.bans().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(c.actuator.bans(), vec![1]);
    let sent = c.actuator.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].contains("no tienes foto de perfil"));
    assert!(!sent[1].contains("no tienes @username"));
    assert_eq!(
        *c.actuator.deleted.lock().expect("deleted lock"),
        vec![42]
    );
    assert_eq!(
        kind_names(&c.log.kinds_for(1).await),
        vec!["warning_issued", "user_kicked"]
    );
    assert!(!c.store.exists(1).await.expect("exists"));
}

#[tokio::test(start_paused = true)]
async fn correcting_profile_within_seconds_withdraws_warning() {
    let c = community(&[]);
    c.inspector.script(2, no_photo_no_handle());
    c.gateway
        .handle(InboundEvent::Message(InboundMessage {
            chat_id: GROUP,
            message_id: 7,
            from: member(2, None),
            text: Some("hola".to_string()),
        }))
        .await
        .expect("message handled");

    tokio::time::sleep(Duration::from_secs(10)).await;
    c.inspector.script(2, ViolationSet::none());
    let outcome = c
        .gateway
        .handle(InboundEvent::Message(InboundMessage {
            chat_id: GROUP,
            message_id: 8,
            from: member(2, Some("dos")),
            text: Some("listo".to_string()),
        }))
        .await
        .expect("message handled");
    assert_eq!(outcome, GatewayOutcome::Compliant { cancelled: true });

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(c.actuator.bans().is_empty());
    let kinds = c.log.kinds_for(2).await;
    assert!(!kinds.contains(&ModerationEventKind::UserKicked));
    assert_eq!(
        kind_names(&kinds),
        vec!["warning_issued", "warning_cancelled"]
    );
    assert_eq!(c.scheduler.live_timer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn administrators_never_reach_the_scheduler() {
    let c = community(&[3]);
    c.inspector.script(3, no_photo_no_handle());

    let outcome = c
        .gateway
        .handle(InboundEvent::Message(InboundMessage {
            chat_id: GROUP,
            message_id: 9,
            from: member(3, None),
            text: Some("soy admin".to_string()),
        }))
        .await
        .expect("message handled");
    assert_eq!(outcome, GatewayOutcome::Exempt);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(c.log.events().await.is_empty());
    assert!(c.actuator.sent().is_empty());
    assert!(c.actuator.bans().is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_violations_restart_the_countdown() {
    let c = community(&[]);
    c.inspector.script(4, no_photo_no_handle());
    for message_id in [10, 11] {
        c.gateway
            .handle(InboundEvent::Message(InboundMessage {
                chat_id: GROUP,
                message_id,
                from: member(4, None),
                text: Some("spam".to_string()),
            }))
            .await
            .expect("message handled");
        tokio::time::sleep(Duration::from_secs(250)).await;
    }
    // 500 s after the first warning, 250 s after the second.
    assert!(c.actuator.bans().is_empty());
    assert_eq!(c.scheduler.live_timer_count(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(c.actuator.bans(), vec![4]);
    assert_eq!(
        kind_names(&c.log.kinds_for(4).await),
        vec!["warning_issued", "warning_issued", "user_kicked"]
    );
    // Both offending messages, the superseded warning and the final one.
    assert_eq!(
        *c.actuator.deleted.lock().expect("deleted lock"),
        vec![10, 11, 42, 43]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_cancel_and_expiry_sanction_at_most_once() {
    let config = ModerationConfig {
        grace_period: Duration::from_millis(40),
        ..ModerationConfig::default()
    };
    let c = Arc::new(community_with(
        config,
        Arc::new(InMemoryWarningStore::new()),
        ScriptedInspector::default(),
    ));
    let users = (100..132).collect::<Vec<UserId>>();
    for user_id in &users {
        c.inspector.script(*user_id, no_photo_no_handle());
        c.scheduler
            .open(WarningRequest {
                user_id: *user_id,
                chat_id: GROUP,
                display_name: user_id.to_string(),
                violations: no_photo_no_handle(),
                challenge_message_id: *user_id,
            })
            .await
            .expect("open");
    }

    tokio::time::sleep(Duration::from_millis(38)).await;
    let mut cancels = Vec::new();
    for user_id in users.clone() {
        let c = c.clone();
        cancels.push(tokio::spawn(async move {
            (user_id, c.scheduler.cancel(user_id).await.expect("cancel"))
        }));
    }
    let mut cancelled = HashMap::new();
    for handle in cancels {
        let (user_id, was_cancelled) = handle.await.expect("join");
        cancelled.insert(user_id, was_cancelled);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let bans = c.actuator.bans();
    for user_id in &users {
        let banned = bans.iter().filter(|banned| *banned == user_id).count();
        assert!(banned <= 1, "user {user_id} banned {banned} times");
        assert_ne!(
            banned == 1,
            cancelled[user_id],
            "user {user_id} must be either cancelled or sanctioned"
        );
    }
    assert_eq!(c.scheduler.live_timer_count(), 0);
}

fn sqlite_community(config: ModerationConfig, store: Arc<SqliteModerationStore>) -> Community {
    let mut c = community_with(config.clone(), store.clone(), ScriptedInspector::default());
    // Route audit rows to SQLite so they outlive the process.
    c.scheduler = ModerationScheduler::new(
        config,
        store.clone(),
        store,
        c.inspector.clone(),
        c.actuator.clone(),
    );
    c.gateway = ModerationGateway::new(
        GatewayConfig { group_id: GROUP },
        c.scheduler.clone(),
        c.inspector.clone(),
        c.actuator.clone(),
    );
    c
}

#[test]
fn persisted_warning_survives_restart_and_expires_once() {
    let temp = tempdir().expect("tempdir");
    let db_path = temp.path().join("moderation.sqlite");
    let config = ModerationConfig {
        grace_period: Duration::from_millis(300),
        ..ModerationConfig::default()
    };

    // First process: warn, then stop before the deadline.
    let first = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    first.block_on(async {
        let store = Arc::new(SqliteModerationStore::new(&db_path).expect("store"));
        let c = sqlite_community(config.clone(), store.clone());
        c.inspector.script(5, no_photo_no_handle());
        c.gateway
            .handle(InboundEvent::MemberJoined(MemberJoined {
                chat_id: GROUP,
                user: member(5, None),
            }))
            .await
            .expect("join handled");
        assert!(store.exists(5).await.expect("exists"));
    });
    drop(first);

    let second = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    second.block_on(async {
        let store = Arc::new(SqliteModerationStore::new(&db_path).expect("reopen"));
        let c = sqlite_community(config.clone(), store.clone());
        c.inspector.script(5, no_photo_no_handle());

        assert_eq!(c.scheduler.recover().await.expect("recover"), 1);
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(c.actuator.bans(), vec![5]);
        assert!(!store.exists(5).await.expect("exists"));
        assert_eq!(c.scheduler.recover().await.expect("second recover"), 0);

        let kinds = store
            .query_events(Some(5))
            .await
            .expect("query")
            .into_iter()
            .map(|event| event.kind)
            .collect::<Vec<_>>();
        assert_eq!(kind_names(&kinds), vec!["warning_issued", "user_kicked"]);
    });
}
