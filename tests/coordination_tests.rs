//! End-to-end coordination scenarios through the facade

use std::collections::BTreeSet;

use chrono::Utc;
use tokio_test::{assert_err, assert_ok};

use dieah_sync::{
    Config, ConflictStrategy, Coordinator, ManualChoice, MemoryRecord, MemoryType, MemoryUpdate,
    NewMemory, OriginKey, QueryFilter, SyncStatus,
};

fn coordinator() -> Coordinator {
    Coordinator::in_memory(Config::default()).unwrap()
}

fn shadows_in(coordinator: &Coordinator, agent_id: &str, user_id: &str) -> Vec<MemoryRecord> {
    coordinator
        .get_agent_memory_slice(agent_id, user_id, &QueryFilter::new().include_shared(true))
        .unwrap()
        .memories
        .into_iter()
        .filter(MemoryRecord::is_shadow)
        .collect()
}

#[tokio::test]
async fn preference_is_shared_with_configured_agents() {
    let c = coordinator();
    let id = c
        .store_agent_memory(
            "alden",
            "u1",
            NewMemory::new("dark mode").category("preference").importance(0.8),
        )
        .await
        .unwrap();

    let report = assert_ok!(c.sync_agent_memories("alden", false).await);
    assert_eq!(report.shadows_created, 2);

    for agent in ["alice", "mimic"] {
        let shadows = shadows_in(&c, agent, "u1");
        assert_eq!(shadows.len(), 1, "{} should hold one shadow", agent);
        assert_eq!(shadows[0].source_agent_id.as_deref(), Some("alden"));
        assert_eq!(shadows[0].content, "dark mode");
        assert_eq!(shadows[0].sync_status, SyncStatus::Synced);
    }
    assert!(shadows_in(&c, "sentry", "u1").is_empty());

    let record = c.get_agent_memory("alden", &id).unwrap();
    assert_eq!(
        record.shared_with,
        BTreeSet::from(["alice".to_string(), "mimic".to_string()])
    );

    let results = c
        .search_agent_memories("alice", "u1", "dark mode", true)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    let context = results.memories[0].sharing_context.as_ref().unwrap();
    assert_eq!(context.source_agent_id, "alden");
    assert_eq!(context.reason, "user-preferences");

    let own_only = c
        .search_agent_memories("alice", "u1", "dark mode", false)
        .await
        .unwrap();
    assert!(own_only.is_empty());
}

#[tokio::test]
async fn highest_importance_keeps_one_record() {
    let c = coordinator();
    let origin = OriginKey::new("alden", "u1", "meeting-day");
    let low = c
        .store()
        .insert(
            MemoryRecord::new("alden", "u1", "Standup is on Monday")
                .with_importance(0.4)
                .with_origin_key(origin.clone()),
        )
        .unwrap();
    let high = c
        .store()
        .insert(
            MemoryRecord::new("alice", "u1", "Standup is on Tuesday")
                .with_importance(0.9)
                .with_origin_key(origin.clone()),
        )
        .unwrap();

    // alice resolves with her default strategy, highest-importance
    let report = c.sync_agent_memories("alice", false).await.unwrap();
    assert_eq!(report.conflicts_resolved, 1);

    let synced: Vec<MemoryRecord> = c
        .store()
        .records_in_origin(&origin)
        .unwrap()
        .into_iter()
        .filter(|r| r.sync_status == SyncStatus::Synced)
        .collect();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].importance, 0.9);
    assert_eq!(synced[0].memory_id, high.memory_id);
    assert_eq!(
        c.store().get(&low.memory_id).unwrap().sync_status,
        SyncStatus::Deleted
    );
}

#[tokio::test]
async fn concurrent_shadow_edit_flows_back_to_origin() {
    let c = coordinator();
    let id = c
        .store_agent_memory(
            "alden",
            "u1",
            NewMemory::new("Prefers tea").category("preference").importance(0.4),
        )
        .await
        .unwrap();
    c.sync_agent_memories("alden", false).await.unwrap();

    let shadow = shadows_in(&c, "alice", "u1").remove(0);
    c.update_agent_memory(
        "alice",
        &shadow.memory_id,
        MemoryUpdate {
            content: Some("Prefers green tea, no sugar".into()),
            importance: Some(0.9),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    c.update_agent_memory(
        "alden",
        &id,
        MemoryUpdate {
            content: Some("Prefers black tea".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let report = c.sync_agent_memories("alice", false).await.unwrap();
    assert_eq!(report.conflicts_detected, 1);
    assert_eq!(report.conflicts_resolved, 1);

    let origin = c.get_agent_memory("alden", &id).unwrap();
    assert_eq!(origin.content, "Prefers green tea, no sugar");
    assert_eq!(origin.sync_status, SyncStatus::Synced);
    assert_eq!(origin.version, 3);

    for agent in ["alice", "mimic"] {
        let copy = shadows_in(&c, agent, "u1").remove(0);
        assert_eq!(copy.content, origin.content);
        assert_eq!(copy.sync_status, SyncStatus::Synced);
    }
}

#[tokio::test]
async fn sync_leaves_nothing_pending() {
    let c = coordinator();
    for (agent, category) in [
        ("alden", "preference"),
        ("alice", "behavior"),
        ("sentry", "security"),
        ("mimic", "style"),
    ] {
        for i in 0..3 {
            c.store_agent_memory(agent, "u1", NewMemory::new(format!("{} fact {}", agent, i)).category(category))
                .await
                .unwrap();
        }
    }

    let report = c.sync_all_agents(false).await;
    assert!(report.success());
    assert_eq!(report.agents_synced.len(), 4);

    for agent in c.list_agents() {
        let pending = c
            .store()
            .records_for_agent(agent.id(), |r| r.sync_status == SyncStatus::Pending)
            .unwrap();
        assert!(pending.is_empty(), "{} still has pending records", agent.id());
    }
}

#[tokio::test]
async fn forced_passes_are_idempotent() {
    let c = coordinator();
    c.store_agent_memory("alden", "u1", NewMemory::new("likes jazz").category("preference"))
        .await
        .unwrap();
    c.store_agent_memory(
        "sentry",
        "u1",
        NewMemory::new("new login").category("security").tags(["security-incident"]),
    )
    .await
    .unwrap();
    c.sync_all_agents(false).await;

    let snapshot = |c: &Coordinator| {
        let mut records: Vec<(String, u64, SyncStatus, String)> = c
            .store()
            .records_for_user("u1")
            .unwrap()
            .into_iter()
            .map(|r| (r.memory_id, r.version, r.sync_status, r.content))
            .collect();
        records.sort();
        records
    };

    let first = c.sync_all_agents(true).await;
    let after_first = snapshot(&c);
    let second = c.sync_all_agents(true).await;
    let after_second = snapshot(&c);

    assert!(first.success() && second.success());
    assert_eq!(after_first, after_second);
    assert!(second.agent_results.values().all(|r| r.writes() == 0));
}

#[tokio::test]
async fn restricted_category_never_leaves_the_owner() {
    let c = coordinator();
    // Would match the auto-propagate rule, but the category is restricted for alden
    c.store_agent_memory(
        "alden",
        "u1",
        NewMemory::new("Talked about the family trip")
            .category("personal_conversation")
            .tags(["preference-change"])
            .share_with(["alice", "sentry"]),
    )
    .await
    .unwrap();

    c.sync_all_agents(true).await;
    for agent in ["alice", "sentry", "mimic"] {
        assert!(shadows_in(&c, agent, "u1").is_empty());
    }
    assert_eq!(c.get_memory_allocation("u1").unwrap().agents.len(), 1);
}

#[tokio::test]
async fn explicit_share_requests_are_honored() {
    let c = coordinator();
    c.store_agent_memory(
        "alice",
        "u1",
        NewMemory::new("Usually replies within an hour").share_with(["sentry"]),
    )
    .await
    .unwrap();

    c.sync_agent_memories("alice", false).await.unwrap();
    let shadows = shadows_in(&c, "sentry", "u1");
    assert_eq!(shadows.len(), 1);

    // Retained for later passes, so a forced pass creates nothing new
    let again = c.sync_agent_memories("alice", true).await.unwrap();
    assert_eq!(again.shadows_created, 0);
    assert_eq!(shadows_in(&c, "sentry", "u1").len(), 1);
}

#[tokio::test]
async fn manual_review_round_trip() {
    let c = coordinator();
    let origin = OriginKey::new("sentry", "u1", "badge");
    let first = c
        .store()
        .insert(
            MemoryRecord::new("sentry", "u1", "Badge reader offline")
                .with_category("security")
                .with_origin_key(origin.clone()),
        )
        .unwrap();
    let second = c
        .store()
        .insert(
            MemoryRecord::new("alden", "u1", "Badge reader replaced")
                .with_category("security")
                .with_origin_key(origin.clone()),
        )
        .unwrap();

    let report = c.sync_agent_memories("sentry", false).await.unwrap();
    assert_eq!(report.conflicts_deferred, 1);

    let pending = c.list_conflicts(true);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].candidate_versions.len(), 2);
    assert_eq!(c.get_coordinator_status().unwrap().pending_conflicts, 1);

    // Held records cannot be edited until the review closes
    let err = c
        .update_agent_memory("sentry", &first.memory_id, MemoryUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, dieah_sync::Error::ConflictPending(_)));

    let resolved = c
        .resolve_conflict(
            &pending[0].conflict_id,
            ManualChoice::Strategy(ConflictStrategy::LatestWins),
        )
        .await
        .unwrap();
    assert!(!resolved.is_pending());
    assert!(c.list_conflicts(true).is_empty());
    assert_eq!(c.list_conflicts(false).len(), 1);

    let live: Vec<MemoryRecord> = [&first, &second]
        .iter()
        .map(|r| c.store().get(&r.memory_id).unwrap())
        .filter(|r| r.sync_status.is_live())
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].sync_status, SyncStatus::Synced);

    // Security alerts go to alden and sentry, so the other one gets a shadow
    let holders = c.store().shared_with(&live[0].memory_id).unwrap();
    assert_eq!(holders.len(), 1);
    assert!(!holders.contains(&live[0].owner_agent_id));
    let stats = c.get_sync_statistics();
    assert_eq!(stats.conflicts_detected, 1);
    assert_eq!(stats.conflicts_resolved, 1);
}

#[tokio::test]
async fn merge_strategy_combines_sentences() {
    let c = coordinator();
    let origin = OriginKey::new("mimic", "u1", "style");
    c.store()
        .insert(
            MemoryRecord::new("mimic", "u1", "Writes short emails. Signs with initials.")
                .with_origin_key(origin.clone())
                .with_tags(["tone"]),
        )
        .unwrap();
    c.store()
        .insert(
            MemoryRecord::new("alice", "u1", "Signs with initials. Avoids emoji.")
                .with_origin_key(origin.clone())
                .with_tags(["format"]),
        )
        .unwrap();

    let report = c
        .sync_engine()
        .sync_agent_with("mimic", false, Some(ConflictStrategy::MergeContent))
        .await
        .unwrap();
    assert_eq!(report.conflicts_resolved, 1);

    let survivors: Vec<MemoryRecord> = c
        .store()
        .records_in_origin(&origin)
        .unwrap()
        .into_iter()
        .filter(|r| r.sync_status == SyncStatus::Synced && !r.is_shadow())
        .collect();
    assert_eq!(survivors.len(), 1);
    let merged = &survivors[0];
    assert_eq!(merged.content.matches("Signs with initials").count(), 1);
    assert!(merged.content.contains("Writes short emails."));
    assert!(merged.content.contains("Avoids emoji."));
    assert_eq!(
        merged.tags,
        BTreeSet::from(["format".to_string(), "tone".to_string()])
    );
}

#[tokio::test]
async fn expired_working_memory_disappears() {
    let c = coordinator();
    let id = c
        .store_agent_memory(
            "alden",
            "u1",
            NewMemory::new("Drafting the quarterly report")
                .memory_type(MemoryType::Working)
                .expires_at(Utc::now() - chrono::Duration::minutes(1)),
        )
        .await
        .unwrap();
    let query = QueryFilter::new().memory_type(MemoryType::Working);
    assert_eq!(c.store().query("alden", "u1", &query).unwrap().len(), 1);

    let expired = c.store().expire_working_memory(Utc::now(), |_| None).unwrap();
    assert_eq!(expired, vec![id.clone()]);
    assert!(c.store().query("alden", "u1", &query).unwrap().is_empty());
    assert_err!(c.get_agent_memory("alden", &id));
}

#[tokio::test]
async fn working_memory_cap_drops_oldest() {
    let mut config = Config::default();
    config.agents[0].max_working_memory_items = 2;
    let c = Coordinator::in_memory(config).unwrap();

    let mut ids = Vec::new();
    for i in 0..4 {
        let id = c
            .store_agent_memory(
                "alden",
                "u1",
                NewMemory::new(format!("scratch {}", i)).memory_type(MemoryType::Working),
            )
            .await
            .unwrap();
        ids.push(id);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let report = c.sync_agent_memories("alden", false).await.unwrap();
    assert_eq!(report.expired, 2);

    let remaining: BTreeSet<String> = c
        .store()
        .query("alden", "u1", &QueryFilter::new())
        .unwrap()
        .into_iter()
        .map(|r| r.memory_id)
        .collect();
    assert_eq!(remaining, BTreeSet::from([ids[2].clone(), ids[3].clone()]));
}

#[tokio::test]
async fn users_are_synced_independently() {
    let c = coordinator();
    let mut ids = Vec::new();
    for user in ["u1", "u2"] {
        let id = c
            .store_agent_memory("alden", user, NewMemory::new("Prefers dark mode").category("preference"))
            .await
            .unwrap();
        ids.push(id);
    }

    // Same words about two users are two facts
    let report = c.sync_agent_memories("alden", false).await.unwrap();
    assert_eq!(report.superseded, 0);
    assert_eq!(report.conflicts_detected, 0);
    assert_eq!(report.shadows_created, 4);
    for (id, user) in ids.iter().zip(["u1", "u2"]) {
        let record = c.get_agent_memory("alden", id).unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.user_id, user);
        for agent in ["alice", "mimic"] {
            let shadows = shadows_in(&c, agent, user);
            assert_eq!(shadows.len(), 1, "{} should hold one copy for {}", agent, user);
            assert_eq!(shadows[0].user_id, user);
        }
    }

    // A diverging edit for u2 stays with u2
    let u2_copy = shadows_in(&c, "alice", "u2").remove(0);
    c.update_agent_memory(
        "alice",
        &u2_copy.memory_id,
        MemoryUpdate {
            content: Some("Prefers dark mode after sunset".into()),
            importance: Some(0.9),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let report = c.sync_agent_memories("alice", false).await.unwrap();
    assert_eq!(report.conflicts_resolved, 1);
    assert_eq!(report.superseded, 0);

    let u1 = c.get_agent_memory("alden", &ids[0]).unwrap();
    let u2 = c.get_agent_memory("alden", &ids[1]).unwrap();
    assert_eq!(u1.content, "Prefers dark mode");
    assert_eq!(u1.sync_status, SyncStatus::Synced);
    assert_eq!(u2.content, "Prefers dark mode after sunset");
    assert_eq!(u2.sync_status, SyncStatus::Synced);
    assert_eq!(shadows_in(&c, "alice", "u1")[0].content, "Prefers dark mode");
    assert_eq!(shadows_in(&c, "mimic", "u2")[0].content, "Prefers dark mode after sunset");
}

#[tokio::test]
async fn reclassified_memory_follows_the_new_rules() {
    let c = coordinator();
    let id = c
        .store_agent_memory("alden", "u1", NewMemory::new("Reads release notes").category("preference"))
        .await
        .unwrap();
    c.sync_agent_memories("alden", false).await.unwrap();
    assert_eq!(
        c.get_agent_memory("alden", &id).unwrap().shared_with,
        BTreeSet::from(["alice".to_string(), "mimic".to_string()])
    );

    // Knowledge goes to alice and sentry, not mimic
    c.update_agent_memory(
        "alden",
        &id,
        MemoryUpdate {
            category: Some("knowledge".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let report = c.sync_agent_memories("alden", true).await.unwrap();
    assert_eq!(report.shadows_refreshed, 1);
    assert_eq!(report.shadows_created, 1);
    assert_eq!(report.shadows_retracted, 1);

    assert_eq!(
        c.get_agent_memory("alden", &id).unwrap().shared_with,
        BTreeSet::from(["alice".to_string(), "sentry".to_string()])
    );
    assert_eq!(shadows_in(&c, "alice", "u1")[0].category, "knowledge");
    assert_eq!(shadows_in(&c, "sentry", "u1")[0].category, "knowledge");
    assert!(shadows_in(&c, "mimic", "u1").is_empty());
}
