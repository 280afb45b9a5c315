#![allow(dead_code)]

use felix_policy_store::{DocstoreAdapter, FilterDescriptor, PolicyModel, PolicySet, PolicyStoreError};
use tokio_util::sync::CancellationToken;

pub fn rules(lines: &[&[&str]]) -> Vec<Vec<String>> {
    let mut rules: Vec<Vec<String>> = lines
        .iter()
        .map(|line| line.iter().map(|token| token.to_string()).collect())
        .collect();
    rules.sort();
    rules
}

pub fn sorted(rules: &[Vec<String>]) -> Vec<Vec<String>> {
    let mut rules = rules.to_vec();
    rules.sort();
    rules
}

/// The classic RBAC example: four `p` rules and one role assignment.
pub fn rbac_policy() -> PolicySet {
    let mut set = PolicySet::new();
    set.add_rule("p", &["alice", "data1", "read"]);
    set.add_rule("p", &["bob", "data2", "write"]);
    set.add_rule("p", &["data2_admin", "data2", "read"]);
    set.add_rule("p", &["data2_admin", "data2", "write"]);
    set.add_rule("g", &["alice", "data2_admin"]);
    set
}

pub async fn load(adapter: &DocstoreAdapter) -> PolicySet {
    let mut set = PolicySet::new();
    adapter
        .load_policy(&CancellationToken::new(), &mut set)
        .await
        .expect("load policy");
    set
}

pub async fn seed(adapter: &DocstoreAdapter) {
    let cancel = CancellationToken::new();
    adapter.clear_policy(&cancel).await.expect("clear");
    adapter
        .save_policy(&cancel, &rbac_policy())
        .await
        .expect("save policy");
}

pub async fn assert_p(adapter: &DocstoreAdapter, expected: &[&[&str]]) {
    let stored = load(adapter).await;
    assert_eq!(sorted(stored.get_policy("p")), rules(expected));
}

/// Save, reload, add, remove and filtered-remove against the RBAC example.
pub async fn adapter_scenario(adapter: &DocstoreAdapter) {
    let cancel = CancellationToken::new();
    seed(adapter).await;
    assert_p(
        adapter,
        &[
            &["alice", "data1", "read"],
            &["bob", "data2", "write"],
            &["data2_admin", "data2", "read"],
            &["data2_admin", "data2", "write"],
        ],
    )
    .await;
    assert_eq!(
        load(adapter).await.get_policy("g"),
        rules(&[&["alice", "data2_admin"]])
    );

    adapter
        .add_policy(&cancel, "p", "p", &["carol", "data1", "write"])
        .await
        .expect("add");
    adapter
        .add_policy(&cancel, "p", "p", &["carol", "data1", "write"])
        .await
        .expect("re-add");
    adapter
        .remove_policy(&cancel, "p", "p", &["carol", "data1", "write"])
        .await
        .expect("remove");
    adapter
        .remove_policy(&cancel, "p", "p", &["carol", "data1", "write"])
        .await
        .expect("remove missing");
    assert_eq!(load(adapter).await.get_policy("p").len(), 4);

    let removed = adapter
        .remove_filtered_policy(&cancel, "p", "p", 0, &["data2_admin"])
        .await
        .expect("remove filtered");
    assert_eq!(removed, 2);
    assert_p(
        adapter,
        &[&["alice", "data1", "read"], &["bob", "data2", "write"]],
    )
    .await;

    adapter
        .remove_filtered_policy(&cancel, "p", "p", 1, &["data1"])
        .await
        .expect("remove filtered");
    assert_p(adapter, &[&["bob", "data2", "write"]]).await;

    adapter
        .remove_filtered_policy(&cancel, "p", "p", 2, &["write"])
        .await
        .expect("remove filtered");
    assert_p(adapter, &[]).await;
    assert_eq!(load(adapter).await.get_policy("g").len(), 1);
}

pub async fn batch_scenario(adapter: &DocstoreAdapter) {
    let cancel = CancellationToken::new();
    adapter.clear_policy(&cancel).await.expect("clear");
    adapter
        .add_policies(
            &cancel,
            "p",
            "p",
            &[
                vec!["jack", "data4", "read"],
                vec!["jack", "data4", "read"],
                vec!["jill", "data4", "write"],
            ],
        )
        .await
        .expect("add policies");
    assert_p(
        adapter,
        &[&["jack", "data4", "read"], &["jill", "data4", "write"]],
    )
    .await;

    adapter
        .remove_policies(
            &cancel,
            "p",
            "p",
            &[vec!["jack", "data4", "read"], vec!["nobody", "data4", "read"]],
        )
        .await
        .expect("remove policies");
    assert_p(adapter, &[&["jill", "data4", "write"]]).await;
}

/// Positional removal with blank positions, on six-field rules.
pub async fn blank_field_removal_scenario(adapter: &DocstoreAdapter) {
    let cancel = CancellationToken::new();
    adapter.clear_policy(&cancel).await.expect("clear");
    adapter
        .add_policy(
            &cancel,
            "p",
            "p",
            &["domain1", "alice", "data3", "read", "accept", "service1"],
        )
        .await
        .expect("add");
    adapter
        .add_policy(
            &cancel,
            "p",
            "p",
            &["domain1", "alice", "data3", "write", "accept", "service2"],
        )
        .await
        .expect("add");

    adapter
        .remove_filtered_policy(&cancel, "p", "p", 0, &["domain1", "", "", "read"])
        .await
        .expect("remove filtered");
    assert_p(
        adapter,
        &[&["domain1", "alice", "data3", "write", "accept", "service2"]],
    )
    .await;

    adapter
        .remove_filtered_policy(&cancel, "p", "p", 0, &["domain1", "", "", "", "", "service2"])
        .await
        .expect("remove filtered");
    assert_p(adapter, &[]).await;
}

/// Filtered loads in every accepted filter shape, and the save guard.
pub async fn filtered_scenario(adapter: &DocstoreAdapter) {
    let cancel = CancellationToken::new();
    adapter.clear_policy(&cancel).await.expect("clear");
    adapter
        .add_policy(&cancel, "p", "p", &["alice", "data1", "write"])
        .await
        .expect("add");
    adapter
        .add_policy(&cancel, "p", "p", &["bob", "data2", "write"])
        .await
        .expect("add");

    let bob = FilterDescriptor::new("v0", "bob");
    let bob_list = vec![bob.clone()];
    let bob_only = rules(&[&["bob", "data2", "write"]]);

    let mut set = PolicySet::new();
    adapter
        .load_filtered_policy(&cancel, &mut set, bob.clone())
        .await
        .expect("single");
    assert_eq!(set.get_policy("p"), bob_only);

    let mut set = PolicySet::new();
    adapter
        .load_filtered_policy(&cancel, &mut set, &bob)
        .await
        .expect("borrowed single");
    assert_eq!(set.get_policy("p"), bob_only);

    let mut set = PolicySet::new();
    adapter
        .load_filtered_policy(&cancel, &mut set, bob_list.clone())
        .await
        .expect("list");
    assert_eq!(set.get_policy("p"), bob_only);

    let mut set = PolicySet::new();
    adapter
        .load_filtered_policy(&cancel, &mut set, &bob_list)
        .await
        .expect("borrowed list");
    assert_eq!(set.get_policy("p"), bob_only);
    assert!(adapter.is_filtered());

    let mut alice = PolicySet::new();
    adapter
        .load_filtered_policy(&cancel, &mut alice, FilterDescriptor::new("v0", "alice"))
        .await
        .expect("alice");
    assert_eq!(alice.get_policy("p"), rules(&[&["alice", "data1", "write"]]));

    let err = adapter
        .save_policy(&cancel, &alice)
        .await
        .expect_err("save while filtered");
    assert!(matches!(err, PolicyStoreError::FilteredSave));
    assert_eq!(load(adapter).await.get_policy("p").len(), 2);

    // The reload above cleared the filtered state.
    assert!(!adapter.is_filtered());
    let mut full = load(adapter).await;
    full.add_policy_line("p", "p", vec!["carol".into(), "data3".into(), "read".into()]);
    adapter.save_policy(&cancel, &full).await.expect("save");
    assert_p(
        adapter,
        &[
            &["alice", "data1", "write"],
            &["bob", "data2", "write"],
            &["carol", "data3", "read"],
        ],
    )
    .await;
}

pub async fn update_scenario(adapter: &DocstoreAdapter) {
    let cancel = CancellationToken::new();
    seed(adapter).await;

    adapter
        .update_policy(
            &cancel,
            "p",
            "p",
            &["alice", "data1", "read"],
            &["alice", "data1", "write"],
        )
        .await
        .expect("update policy");
    assert_p(
        adapter,
        &[
            &["alice", "data1", "write"],
            &["bob", "data2", "write"],
            &["data2_admin", "data2", "read"],
            &["data2_admin", "data2", "write"],
        ],
    )
    .await;

    adapter
        .update_policies(
            &cancel,
            "p",
            "p",
            &[vec!["alice", "data1", "write"], vec!["bob", "data2", "write"]],
            &[vec!["alice", "data1", "read"], vec!["bob", "data2", "read"]],
        )
        .await
        .expect("update policies");
    assert_p(
        adapter,
        &[
            &["alice", "data1", "read"],
            &["bob", "data2", "read"],
            &["data2_admin", "data2", "read"],
            &["data2_admin", "data2", "write"],
        ],
    )
    .await;
}

pub async fn update_filtered_scenario(adapter: &DocstoreAdapter) {
    let cancel = CancellationToken::new();
    seed(adapter).await;

    let removed = adapter
        .update_filtered_policies(
            &cancel,
            "p",
            "p",
            &[vec!["alice", "data1", "write"]],
            0,
            &["alice", "data1", "read"],
        )
        .await
        .expect("update filtered");
    assert_eq!(removed, rules(&[&["alice", "data1", "read"]]));

    let removed = adapter
        .update_filtered_policies(
            &cancel,
            "p",
            "p",
            &[vec!["bob", "data2", "read"]],
            0,
            &["bob", "data2", "write"],
        )
        .await
        .expect("update filtered");
    assert_eq!(removed, rules(&[&["bob", "data2", "write"]]));

    assert_p(
        adapter,
        &[
            &["alice", "data1", "write"],
            &["bob", "data2", "read"],
            &["data2_admin", "data2", "read"],
            &["data2_admin", "data2", "write"],
        ],
    )
    .await;
}
