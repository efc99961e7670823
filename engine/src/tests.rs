// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use task_executor::Executor;
use tempfile::TempDir;

use crate::facade::{build_variables, Facade};
use crate::key::NodeKey;
use crate::progress::Counters;
use options::BuildOptions;

fn facade_over(build_root: std::path::PathBuf) -> Facade {
    let options = BuildOptions {
        build_root,
        ..BuildOptions::default()
    };
    Facade::new(options, Executor::new(2).unwrap())
}

/// Mirrors S1: two evaluations of the same key without any invalidation should re-invoke the
/// underlying function exactly once.
#[tokio::test]
async fn basic_memoization() {
    let tmp = TempDir::new().unwrap();
    let facade = facade_over(tmp.path().to_path_buf());
    let counters = Arc::new(Counters::default());
    facade.register_execution_progress_receiver(counters.clone());

    facade.set_external_input(build_variables::BUILD_ID, serde_json::json!("build-1"));
    facade.register_target_deps(
        NodeKey::ActionExecution("a".to_string()),
        vec![NodeKey::BuildVariable(build_variables::BUILD_ID.to_string())],
    );

    let first = facade.execute(&["a".to_string()], false).await.unwrap();
    let second = facade.execute(&["a".to_string()], false).await.unwrap();

    assert!(first[&NodeKey::ActionExecution("a".to_string())].is_ok());
    assert_eq!(first, second);
    use std::sync::atomic::Ordering::SeqCst;
    assert_eq!(counters.built_fresh.load(SeqCst), 1);
    assert_eq!(counters.reused_clean.load(SeqCst), 1);
}

/// Mirrors S2: changing an injected build variable re-runs its dependents, but re-injecting the
/// same value (even though it dirties the chain) lets every dependent skip re-running once the
/// revalidation check sees unchanged Generations.
#[tokio::test]
async fn change_propagation_with_pruning() {
    let tmp = TempDir::new().unwrap();
    let facade = facade_over(tmp.path().to_path_buf());
    let counters = Arc::new(Counters::default());
    facade.register_execution_progress_receiver(counters.clone());

    let a = NodeKey::ActionExecution("a".to_string());
    let b = NodeKey::ActionExecution("b".to_string());
    facade.register_target_deps(
        a.clone(),
        vec![NodeKey::BuildVariable("input".to_string())],
    );
    facade.register_target_deps(b.clone(), vec![a.clone()]);

    facade.set_external_input("input", serde_json::json!("v1"));
    let r1 = facade.execute(&["b".to_string()], false).await.unwrap();
    let digest_v1 = r1[&b].as_ref().unwrap().as_json().unwrap().clone();

    facade.set_external_input("input", serde_json::json!("v2"));
    let r2 = facade.execute(&["b".to_string()], false).await.unwrap();
    let digest_v2 = r2[&b].as_ref().unwrap().as_json().unwrap().clone();
    assert_ne!(digest_v1, digest_v2);

    use std::sync::atomic::Ordering::SeqCst;
    let built_before = counters.built_fresh.load(SeqCst);

    // Re-inject the same value: `a` is dirtied and must re-read the build variable, but its
    // output is unchanged, so `b` should be cleaned rather than re-run.
    facade.set_external_input("input", serde_json::json!("v2"));
    let r3 = facade.execute(&["b".to_string()], false).await.unwrap();
    let digest_v2_again = r3[&b].as_ref().unwrap().as_json().unwrap().clone();
    assert_eq!(digest_v2, digest_v2_again);
    assert_eq!(counters.built_fresh.load(SeqCst), built_before);
}

/// Mirrors S3: a dependency cycle is reported as an Error to every participant, exactly once.
#[tokio::test]
async fn cycle_is_reported() {
    let tmp = TempDir::new().unwrap();
    let facade = facade_over(tmp.path().to_path_buf());

    let x = NodeKey::ActionExecution("x".to_string());
    let y = NodeKey::ActionExecution("y".to_string());
    facade.register_target_deps(x.clone(), vec![y.clone()]);
    facade.register_target_deps(y, vec![x.clone()]);

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        facade.execute(&["x".to_string()], true),
    )
    .await
    .expect("cycle was not detected in time")
    .unwrap();

    match &result[&x] {
        Err(crate::key::EngineError::Cyclic(participants)) => {
            assert!(participants.len() >= 2);
        }
        other => panic!("expected a cyclic error, got {other:?}"),
    }
}

/// Mirrors S4: in keep-going mode, an independent success and a dependent-on-failure both
/// resolve, with the dependent carrying the root cause.
#[tokio::test]
async fn keep_going_partial_failure() {
    let tmp = TempDir::new().unwrap();
    let facade = facade_over(tmp.path().to_path_buf());

    let a = NodeKey::ActionExecution("a".to_string());
    let b = NodeKey::ActionExecution("b".to_string());
    let c = NodeKey::ActionExecution("c".to_string());
    // `a` depends on a build variable that is never injected, so it fails.
    facade.register_target_deps(
        a.clone(),
        vec![NodeKey::BuildVariable("never-injected".to_string())],
    );
    facade.register_target_deps(c.clone(), vec![a.clone(), b.clone()]);

    let result = facade
        .execute(
            &["a".to_string(), "b".to_string(), "c".to_string()],
            true,
        )
        .await
        .unwrap();

    assert!(result[&a].is_err());
    assert!(result[&b].is_ok());
    assert!(result[&c].is_err());
}

/// Mirrors S6: deleting a package causes the next evaluation to fail with `NoSuchPackage`, and
/// reverting restores success.
#[tokio::test]
async fn deleted_package_invalidation() {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("foo")).unwrap();
    std::fs::write(tmp.path().join("foo/BUILD"), "").unwrap();
    let facade = facade_over(tmp.path().to_path_buf());

    let package = facade.get_package("foo").await;
    assert!(package.is_ok());

    facade.set_deleted_packages(&["foo".to_string()]);
    let deleted = facade.get_package("foo").await;
    assert!(matches!(
        deleted,
        Err(crate::facade::FacadeError::NoSuchPackage(_))
    ));

    facade.unset_deleted_packages(&["foo".to_string()]);
    let restored = facade.get_package("foo").await;
    assert!(restored.is_ok());
}

/// `evaluate_configurations` should assemble the injected default-visibility and
/// test-environment-variables build variables into one value.
#[tokio::test]
async fn evaluate_configurations_assembles_build_variables() {
    let tmp = TempDir::new().unwrap();
    let options = BuildOptions {
        build_root: tmp.path().to_path_buf(),
        default_visibility: vec!["PUBLIC".to_string()],
        ..BuildOptions::default()
    };
    let facade = Facade::new(options, Executor::new(2).unwrap());

    let configuration = facade.evaluate_configurations(false).await.unwrap();
    let body = configuration.as_json().unwrap();
    assert_eq!(body["default_visibility"], serde_json::json!(["PUBLIC"]));
}

/// `notify_modified_paths` must invalidate the `FileState` of the modified file so that a
/// subsequent read observes the new content's directory listing.
#[tokio::test]
async fn notify_modified_paths_invalidates_directory_listing() {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("pkg")).unwrap();
    let facade = facade_over(tmp.path().to_path_buf());

    let before = facade.get_package("pkg").await;
    assert!(before.is_err(), "an empty package directory has no targets");

    std::fs::write(tmp.path().join("pkg/BUILD"), "").unwrap();
    facade.notify_modified_paths(&[std::path::PathBuf::from("pkg/BUILD")]);

    let after = facade.get_package("pkg").await;
    assert!(after.is_ok());
}

/// Mirrors §4.4.7: a cancellation requested before an `evaluate_*` call starts is observed
/// cooperatively, short-circuiting the call with `Interrupted` rather than running any key.
#[tokio::test]
async fn cancellation_short_circuits_fail_fast_evaluation() {
    let tmp = TempDir::new().unwrap();
    let facade = facade_over(tmp.path().to_path_buf());
    facade.register_target_deps(
        NodeKey::ActionExecution("a".to_string()),
        vec![NodeKey::BuildVariable("never-injected".to_string())],
    );

    facade.cancel();
    assert!(facade.is_cancelled());

    let result = facade.execute(&["a".to_string()], false).await;
    assert!(matches!(
        result,
        Err(crate::facade::FacadeError::Interrupted)
    ));

    facade.reset();
    assert!(!facade.is_cancelled());
}
