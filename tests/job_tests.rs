mod test_harness;

use std::path::PathBuf;

use digits_lite::error::SchedulerError;
use digits_lite::scheduler::{
    DatasetParams, DatasetSource, DependencyResolver, DispatchPool, Job, JobId, JobKind,
    JobKindTag, JobState, JobStore, ModelParams, Network, NewJob,
};

use test_harness::labeled_folder;

fn lenet(dataset: JobId) -> ModelParams {
    ModelParams::new(
        dataset,
        Network::Standard {
            name: "lenet".to_string(),
        },
    )
}

fn dataset_job(store: &mut JobStore, name: &str) -> JobId {
    let id = store.allocate_id();
    let seq = store.next_seq();
    let job = Job::new(
        id,
        seq,
        name.to_string(),
        JobKind::Dataset(DatasetParams::from_folder("/data/images")),
        PathBuf::from(format!("/jobs/{}", id)),
    );
    store.insert(job).unwrap();
    id
}

fn model_job(store: &mut JobStore, name: &str, dataset: JobId) -> JobId {
    let id = store.allocate_id();
    let seq = store.next_seq();
    let job = Job::new(
        id,
        seq,
        name.to_string(),
        JobKind::Model(lenet(dataset)),
        PathBuf::from(format!("/jobs/{}", id)),
    );
    store.insert(job).unwrap();
    id
}

// =============================================================================
// State machine
// =============================================================================

#[test]
fn test_state_display_strings() {
    let states = [
        (JobState::Initialized, "Initialized"),
        (JobState::Waiting, "Waiting"),
        (JobState::Running, "Running"),
        (JobState::Done, "Done"),
        (JobState::Abort, "Abort"),
        (JobState::Error, "Error"),
    ];
    for (state, text) in states {
        assert_eq!(state.to_string(), text);
        assert_eq!(text.parse::<JobState>().unwrap(), state);
    }
    assert!("Aborted".parse::<JobState>().is_err());
}

#[test]
fn test_allowed_transitions() {
    use JobState::*;
    let all = [Initialized, Waiting, Running, Done, Abort, Error];
    let allowed = [
        (Initialized, Waiting),
        (Initialized, Running),
        (Waiting, Running),
        (Waiting, Abort),
        (Running, Done),
        (Running, Error),
        (Running, Abort),
    ];
    for from in all {
        for to in all {
            assert_eq!(
                from.can_transition_to(to),
                allowed.contains(&(from, to)),
                "{} -> {}",
                from,
                to
            );
        }
    }
}

#[test]
fn test_terminal_states_are_final() {
    for state in [JobState::Done, JobState::Abort, JobState::Error] {
        assert!(state.is_terminal());
        for next in [
            JobState::Initialized,
            JobState::Waiting,
            JobState::Running,
            JobState::Done,
            JobState::Abort,
            JobState::Error,
        ] {
            assert!(!state.can_transition_to(next));
        }
    }
    assert!(JobState::Abort.is_failed());
    assert!(JobState::Error.is_failed());
    assert!(!JobState::Done.is_failed());
}

#[test]
fn test_job_transition_records_history_and_timestamps() {
    let id = JobId::new();
    let mut job = Job::new(
        id,
        1,
        "mnist".to_string(),
        JobKind::Dataset(DatasetParams::from_folder("/data")),
        PathBuf::from("/jobs/x"),
    );
    assert_eq!(job.state, JobState::Initialized);
    assert!(job.started_at.is_none());

    job.transition(JobState::Running, None).unwrap();
    assert!(job.started_at.is_some());

    job.transition(JobState::Error, Some("disk full".to_string()))
        .unwrap();
    assert_eq!(job.error.as_deref(), Some("disk full"));
    assert!(job.finished_at.is_some());
    assert_eq!(
        job.observed_states(),
        vec![JobState::Initialized, JobState::Running, JobState::Error]
    );

    let err = job.transition(JobState::Running, None).unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::InvalidTransition {
            from: JobState::Error,
            to: JobState::Running
        }
    ));
    assert_eq!(job.history.len(), 3);
}

#[test]
fn test_error_text_only_kept_for_error_state() {
    let mut job = Job::new(
        JobId::new(),
        1,
        "d".to_string(),
        JobKind::Dataset(DatasetParams::from_folder("/data")),
        PathBuf::from("/jobs/d"),
    );
    job.transition(JobState::Running, None).unwrap();
    job.transition(JobState::Abort, Some("ignored".to_string()))
        .unwrap();
    assert!(job.error.is_none());
}

// =============================================================================
// Parameters
// =============================================================================

#[test]
fn test_dataset_params_validate_labeled_folder() {
    let tmp = tempfile::tempdir().unwrap();
    let images = labeled_folder(tmp.path(), 3, 10);
    assert!(DatasetParams::from_folder(&images).validate().is_ok());
}

#[test]
fn test_dataset_params_reject_empty_folder() {
    let tmp = tempfile::tempdir().unwrap();
    let empty = tmp.path().join("empty");
    std::fs::create_dir(&empty).unwrap();
    // A label folder without images does not count
    std::fs::create_dir(empty.join("class_0")).unwrap();

    let err = DatasetParams::from_folder(&empty).validate().unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
    assert!(err.to_string().contains("no labeled images"));
}

#[test]
fn test_dataset_params_reject_missing_folder() {
    let err = DatasetParams::from_folder("/definitely/not/here")
        .validate()
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
}

#[cfg(unix)]
#[test]
fn test_dataset_params_unreadable_label_folder_is_validation_error() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().unwrap();
    let images = labeled_folder(tmp.path(), 2, 3);
    let locked = images.join("class_1");
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

    // Permission bits do not bind root
    if std::fs::read_dir(&locked).is_ok() {
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let err = DatasetParams::from_folder(&images).validate().unwrap_err();
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
    assert!(matches!(err, SchedulerError::Validation(_)));
    assert!(err.to_string().contains("cannot read"));
}

#[test]
fn test_dataset_params_reject_bad_resize_and_percent() {
    let tmp = tempfile::tempdir().unwrap();
    let images = labeled_folder(tmp.path(), 2, 1);

    assert!(DatasetParams::from_folder(&images)
        .with_resize(0, 32)
        .validate()
        .is_err());

    let params = DatasetParams {
        source: DatasetSource::Folder {
            train_folder: images,
            val_folder: None,
            val_percent: 101,
        },
        resize_width: 28,
        resize_height: 28,
    };
    assert!(params.validate().is_err());
}

#[test]
fn test_dataset_params_textfile() {
    let tmp = tempfile::tempdir().unwrap();
    let train = tmp.path().join("train.txt");
    let labels = tmp.path().join("labels.txt");
    std::fs::write(&train, "a.png 0\nb.png 1\n").unwrap();
    std::fs::write(&labels, "cat\ndog\n").unwrap();

    let params = DatasetParams {
        source: DatasetSource::TextFile {
            train_images: train.clone(),
            val_images: None,
            labels_file: labels.clone(),
            image_folder: None,
        },
        resize_width: 32,
        resize_height: 32,
    };
    assert!(params.validate().is_ok());
    assert_eq!(params.method(), "textfile");

    std::fs::write(&labels, "").unwrap();
    assert!(params.validate().is_err());
}

#[test]
fn test_dataset_params_json_defaults() {
    let params: DatasetParams = serde_json::from_value(serde_json::json!({
        "method": "folder",
        "train_folder": "/data/images"
    }))
    .unwrap();
    assert_eq!(params.resize_width, 256);
    assert_eq!(params.resize_height, 256);
    match params.source {
        DatasetSource::Folder { val_percent, .. } => assert_eq!(val_percent, 25),
        other => panic!("unexpected source {:?}", other),
    }
}

#[test]
fn test_model_params_validate() {
    let dataset = JobId::new();
    assert!(lenet(dataset).validate().is_ok());
    assert!(lenet(dataset).with_epochs(0).validate().is_err());
    assert!(lenet(dataset).with_batch_size(0).validate().is_err());

    let mut params = lenet(dataset);
    params.learning_rate = -1.0;
    assert!(params.validate().is_err());

    let custom = ModelParams::new(
        dataset,
        Network::Custom {
            definition: "  ".to_string(),
        },
    );
    assert!(custom.validate().is_err());
}

#[test]
fn test_new_model_job_depends_on_its_dataset() {
    let dataset = JobId::new();
    let job = NewJob::model("m", lenet(dataset)).depends_on(dataset);
    assert_eq!(job.depends_on, vec![dataset]);
    assert_eq!(job.kind.tag(), JobKindTag::Model);
    assert_eq!(job.kind.required_prerequisite(), Some(JobKindTag::Dataset));
}

#[test]
fn test_new_job_rejects_blank_name() {
    let job = NewJob::dataset("  ", DatasetParams::from_folder("/data"));
    assert!(matches!(job.validate(), Err(SchedulerError::Validation(_))));
}

// =============================================================================
// Store
// =============================================================================

#[test]
fn test_store_insert_get_remove() {
    let mut store = JobStore::new();
    let d = dataset_job(&mut store, "d");
    let m = model_job(&mut store, "m", d);

    assert_eq!(store.len(), 2);
    assert_eq!(store.state_of(&d), Some(JobState::Initialized));
    assert_eq!(store.jobs_of_kind(JobKindTag::Model).len(), 1);
    let order: Vec<JobId> = store.all_jobs().iter().map(|j| j.id).collect();
    assert_eq!(order, vec![d, m]);

    let removed = store.remove(&d).unwrap();
    assert_eq!(removed.id, d);
    assert!(store.get(&d).is_none());
    assert!(store.was_deleted(&d));
    assert!(store.remove(&d).is_none());
}

#[test]
fn test_store_refuses_reused_id() {
    let mut store = JobStore::new();
    let d = dataset_job(&mut store, "d");
    store.remove(&d);

    let again = Job::new(
        d,
        store.next_seq(),
        "again".to_string(),
        JobKind::Dataset(DatasetParams::from_folder("/data")),
        PathBuf::from("/jobs/again"),
    );
    assert!(store.insert(again).is_err());
    assert_ne!(store.allocate_id(), d);
}

#[test]
fn test_store_capacity() {
    let mut store = JobStore::with_capacity(1);
    dataset_job(&mut store, "d");
    assert!(store.is_full());

    let job = Job::new(
        JobId::new(),
        store.next_seq(),
        "d2".to_string(),
        JobKind::Dataset(DatasetParams::from_folder("/data")),
        PathBuf::from("/jobs/d2"),
    );
    assert!(matches!(store.insert(job), Err(SchedulerError::AtCapacity)));
}

#[test]
fn test_store_transition() {
    let mut store = JobStore::new();
    let d = dataset_job(&mut store, "d");

    let (from, change) = store.transition(&d, JobState::Running, None).unwrap();
    assert_eq!(from, JobState::Initialized);
    assert_eq!(change.state, JobState::Running);
    assert_eq!(store.jobs_in_state(JobState::Running).len(), 1);

    assert!(store
        .transition(&JobId::new(), JobState::Running, None)
        .is_err());
}

// =============================================================================
// Dependency resolver
// =============================================================================

#[test]
fn test_declare_records_both_ends() {
    let mut store = JobStore::new();
    let resolver = DependencyResolver::new();
    let d = dataset_job(&mut store, "d");
    let m = model_job(&mut store, "m", d);

    resolver.declare(&mut store, m, d).unwrap();
    assert!(store.get(&d).unwrap().dependents.contains(&m));
    assert!(store.get(&m).unwrap().dependencies.contains(&d));
    assert!(DependencyResolver::has_dependents(&store, &d));
    assert!(!DependencyResolver::has_dependents(&store, &m));
}

#[test]
fn test_declare_rejects_self_missing_and_cycles() {
    let mut store = JobStore::new();
    let resolver = DependencyResolver::new();
    let a = dataset_job(&mut store, "a");
    let b = dataset_job(&mut store, "b");

    assert!(resolver.declare(&mut store, a, a).is_err());
    assert!(resolver.declare(&mut store, a, JobId::new()).is_err());

    resolver.declare(&mut store, b, a).unwrap();
    let err = resolver.declare(&mut store, a, b).unwrap_err();
    assert!(err.to_string().contains("cycle"));
}

#[test]
fn test_validate_prerequisite() {
    let mut store = JobStore::new();
    let d = dataset_job(&mut store, "d");
    let m = model_job(&mut store, "m", d);
    let model_kind = JobKind::Model(lenet(d));

    assert!(DependencyResolver::validate_prerequisite(&store, &model_kind, &d).is_ok());

    // A model may only train on a dataset
    let err = DependencyResolver::validate_prerequisite(&store, &model_kind, &m).unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));

    assert!(DependencyResolver::validate_prerequisite(&store, &model_kind, &JobId::new()).is_err());

    store.remove(&m);
    let err = DependencyResolver::validate_prerequisite(&store, &model_kind, &m).unwrap_err();
    assert!(err.to_string().contains("deleted"));
}

#[test]
fn test_wake_after_all_prerequisites_done() {
    let mut store = JobStore::new();
    let mut resolver = DependencyResolver::new();
    let a = dataset_job(&mut store, "a");
    let b = dataset_job(&mut store, "b");
    let m = model_job(&mut store, "m", a);
    resolver.declare(&mut store, m, a).unwrap();
    resolver.declare(&mut store, m, b).unwrap();

    assert!(!DependencyResolver::is_satisfied(&store, &m));
    resolver.register_interest(&store, m);
    assert!(resolver.is_waiting(&m));
    assert_eq!(resolver.waiting_dependents(&store, &a), vec![m]);

    store.transition(&a, JobState::Running, None).unwrap();
    store.transition(&a, JobState::Done, None).unwrap();
    assert!(resolver.on_dependency_resolved(&store, &a).is_empty());

    store.transition(&b, JobState::Running, None).unwrap();
    store.transition(&b, JobState::Done, None).unwrap();
    assert_eq!(resolver.on_dependency_resolved(&store, &b), vec![m]);
    assert!(!resolver.is_waiting(&m));
    assert!(DependencyResolver::is_satisfied(&store, &m));
}

#[test]
fn test_failed_prerequisites_and_forget() {
    let mut store = JobStore::new();
    let mut resolver = DependencyResolver::new();
    let d = dataset_job(&mut store, "d");
    let m = model_job(&mut store, "m", d);
    resolver.declare(&mut store, m, d).unwrap();
    resolver.register_interest(&store, m);

    store.transition(&d, JobState::Running, None).unwrap();
    store
        .transition(&d, JobState::Error, Some("bad".to_string()))
        .unwrap();
    assert_eq!(DependencyResolver::failed_prerequisites(&store, &m), vec![d]);

    resolver.forget(&mut store, &m);
    assert!(!resolver.is_waiting(&m));
    assert!(!DependencyResolver::has_dependents(&store, &d));
}

// =============================================================================
// Dispatch pool
// =============================================================================

#[test]
fn test_pool_dispatches_fifo_within_capacity() {
    let mut pool = DispatchPool::new(2);
    let ids: Vec<JobId> = (0..4).map(|_| JobId::new()).collect();
    // Enqueued out of order, dispatched by submission number
    pool.enqueue(3, ids[2]);
    pool.enqueue(1, ids[0]);
    pool.enqueue(4, ids[3]);
    pool.enqueue(2, ids[1]);
    assert_eq!(pool.queued_count(), 4);

    assert_eq!(pool.next_dispatchable(), Some(ids[0]));
    assert_eq!(pool.next_dispatchable(), Some(ids[1]));
    assert_eq!(pool.next_dispatchable(), None);
    assert_eq!(pool.running_count(), 2);

    assert!(pool.release(&ids[0]));
    assert_eq!(pool.next_dispatchable(), Some(ids[2]));
}

#[test]
fn test_pool_dequeue_and_duplicates() {
    let mut pool = DispatchPool::new(1);
    let a = JobId::new();
    let b = JobId::new();
    pool.enqueue(1, a);
    pool.enqueue(1, a);
    pool.enqueue(2, b);
    assert_eq!(pool.queued_count(), 2);

    assert!(pool.dequeue(&a));
    assert!(!pool.is_queued(&a));
    assert!(!pool.dequeue(&a));
    assert_eq!(pool.next_dispatchable(), Some(b));
    assert!(pool.is_running(&b));
    assert!(!pool.has_capacity());
}

#[test]
fn test_pool_minimum_capacity_is_one() {
    let pool = DispatchPool::new(0);
    assert_eq!(pool.max_running(), 1);
}
