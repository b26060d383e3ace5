use crate::domain::{
    AckItem, AckKind, ApplyErrorKind, ApplyReport, ApplyResults, AssignItem, CreateFaceItem,
    DomainError, ItemResult, ItemStatus, ProgressEvent, RemoteFaceCreate, RenameItem, TargetApi,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Consecutive transport-level failures after which the batch is declared
/// dead and the remaining items are aborted.
const TRANSPORT_COLLAPSE_LIMIT: usize = 3;

/// Applies operation batches against the target service, one item at a
/// time. No retries: a failed item is recorded and the batch moves on.
/// Cancellation is cooperative; the flag is checked before each item and
/// the in-flight call always runs to completion.
pub struct Executor {
    tx: broadcast::Sender<ProgressEvent>,
    cancel: Arc<AtomicBool>,
}

enum ItemOutcome {
    Success(String),
    Failed(ApplyErrorKind, String),
}

impl Executor {
    pub fn new(tx: broadcast::Sender<ProgressEvent>) -> Self {
        Self {
            tx,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The shared cancellation handle. Raising it stops the executor
    /// before the next item; already-running calls are not interrupted.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Renames each cluster to its chosen source person. Hard invariant:
    /// an already-named cluster is never overwritten; it fails the item
    /// with `already_named` instead.
    pub async fn rename_clusters(
        &self,
        api: Arc<dyn TargetApi>,
        items: Vec<RenameItem>,
        dry_run: bool,
    ) -> ApplyReport {
        self.cancel.store(false, Ordering::SeqCst);
        let labels: Vec<String> = items
            .iter()
            .map(|i| format!("{} -> {}", i.cluster_id, i.src_person_name))
            .collect();
        let mut batch = BatchRun::new(&self.tx, "rename_clusters", &labels);

        let mut transport_failures = 0usize;
        for (index, item) in items.iter().enumerate() {
            if self.cancelled() {
                batch.mark_remaining_pending(index, &labels);
                break;
            }
            batch.processing(index, &labels[index]);
            if dry_run {
                batch.skip(index, &labels[index], "dry run, no changes applied");
                continue;
            }
            let outcome = apply_rename(api.as_ref(), item).await;
            if batch.record(index, &labels[index], outcome, &mut transport_failures) {
                batch.abort_remaining(index + 1, &labels);
                break;
            }
        }
        batch.finish()
    }

    /// Reassigns unclustered faces to the named person, creating the
    /// person first when no target person with that name exists. Items
    /// are individual faces so progress stays face-level.
    pub async fn assign_unclustered_faces(
        &self,
        api: Arc<dyn TargetApi>,
        groups: Vec<AssignItem>,
        dry_run: bool,
    ) -> ApplyReport {
        self.cancel.store(false, Ordering::SeqCst);
        let mut labels = Vec::new();
        for g in &groups {
            for face_id in &g.face_ids {
                labels.push(format!("{} -> {}", face_id, g.src_person_name));
            }
        }
        let mut batch = BatchRun::new(&self.tx, "assign_unclustered", &labels);

        let mut transport_failures = 0usize;
        let mut index = 0usize;
        'groups: for group in &groups {
            // Person resolution happens once per group; its failure fails
            // every face in the group.
            let mut person_id: Option<String> = None;
            let mut group_error: Option<(ApplyErrorKind, String)> = None;
            if !dry_run && !group.face_ids.is_empty() && !self.cancelled() {
                match resolve_person(api.as_ref(), &group.src_person_name).await {
                    Ok(id) => person_id = Some(id),
                    Err(e) => group_error = Some(e),
                }
            }

            for face_id in &group.face_ids {
                if self.cancelled() {
                    batch.mark_remaining_pending(index, &labels);
                    break 'groups;
                }
                batch.processing(index, &labels[index]);
                if dry_run {
                    batch.skip(index, &labels[index], "dry run, no changes applied");
                    index += 1;
                    continue;
                }
                let outcome = match (&person_id, &group_error) {
                    (Some(pid), _) => match api.reassign_face(face_id, pid).await {
                        Ok(()) => ItemOutcome::Success(format!(
                            "assigned to person '{}'",
                            group.src_person_name
                        )),
                        Err(e) => ItemOutcome::Failed(classify_api_error(&e, ApplyErrorKind::AssignFailed), e.to_string()),
                    },
                    (None, Some((kind, msg))) => ItemOutcome::Failed(*kind, msg.clone()),
                    (None, None) => ItemOutcome::Failed(
                        ApplyErrorKind::Other,
                        "person resolution skipped".to_string(),
                    ),
                };
                let collapsed = batch.record(index, &labels[index], outcome, &mut transport_failures);
                index += 1;
                if collapsed {
                    batch.abort_remaining(index, &labels);
                    break 'groups;
                }
            }
        }
        batch.finish()
    }

    /// Creates faces on the target side for one source person, one call
    /// per face, after the same reuse-or-create person preamble.
    pub async fn create_faces(
        &self,
        api: Arc<dyn TargetApi>,
        src_person_name: &str,
        items: Vec<CreateFaceItem>,
        dry_run: bool,
    ) -> ApplyReport {
        self.cancel.store(false, Ordering::SeqCst);
        let labels: Vec<String> = items
            .iter()
            .enumerate()
            .map(|(i, f)| format!("face {} on {}", i + 1, f.asset_id))
            .collect();
        let mut batch = BatchRun::new(&self.tx, "create_faces", &labels);

        let mut person_id: Option<String> = None;
        let mut group_error: Option<(ApplyErrorKind, String)> = None;
        if !dry_run && !items.is_empty() {
            match resolve_person(api.as_ref(), src_person_name).await {
                Ok(id) => person_id = Some(id),
                Err(e) => group_error = Some(e),
            }
        }

        let mut transport_failures = 0usize;
        for (index, item) in items.iter().enumerate() {
            if self.cancelled() {
                batch.mark_remaining_pending(index, &labels);
                break;
            }
            batch.processing(index, &labels[index]);
            if dry_run {
                batch.skip(index, &labels[index], "dry run, no changes applied");
                continue;
            }
            let outcome = match (&person_id, &group_error) {
                (Some(pid), _) => {
                    let face = RemoteFaceCreate {
                        asset_id: item.asset_id.clone(),
                        person_id: pid.clone(),
                        x: item.x,
                        y: item.y,
                        width: item.width,
                        height: item.height,
                        image_width: item.image_width,
                        image_height: item.image_height,
                    };
                    match api.create_face(&face).await {
                        Ok(()) => ItemOutcome::Success(format!(
                            "created face for '{}'",
                            src_person_name
                        )),
                        Err(e) => ItemOutcome::Failed(
                            classify_api_error(&e, ApplyErrorKind::CreateFailed),
                            e.to_string(),
                        ),
                    }
                }
                (None, Some((kind, msg))) => ItemOutcome::Failed(*kind, msg.clone()),
                (None, None) => ItemOutcome::Failed(
                    ApplyErrorKind::Other,
                    "person resolution skipped".to_string(),
                ),
            };
            if batch.record(index, &labels[index], outcome, &mut transport_failures) {
                batch.abort_remaining(index + 1, &labels);
                break;
            }
        }
        batch.finish()
    }

    /// Merge and fix operations have no target-side API; applying them is
    /// bookkeeping for the progress stream only.
    pub async fn acknowledge(
        &self,
        kind: AckKind,
        items: Vec<AckItem>,
        dry_run: bool,
    ) -> ApplyReport {
        self.cancel.store(false, Ordering::SeqCst);
        let operation = match kind {
            AckKind::Merge => "acknowledge_merges",
            AckKind::Fix => "acknowledge_fixes",
        };
        let labels: Vec<String> = items
            .iter()
            .map(|i| format!("{} ({} clusters)", i.src_person_name, i.cluster_ids.len()))
            .collect();
        let mut batch = BatchRun::new(&self.tx, operation, &labels);

        for (index, _item) in items.iter().enumerate() {
            if self.cancelled() {
                batch.mark_remaining_pending(index, &labels);
                break;
            }
            batch.processing(index, &labels[index]);
            if dry_run {
                batch.skip(index, &labels[index], "dry run, no changes applied");
            } else {
                batch.record(index, &labels[index], ItemOutcome::Success("acknowledged".into()), &mut 0);
            }
        }
        batch.finish()
    }
}

async fn apply_rename(
    api: &dyn TargetApi,
    item: &RenameItem,
) -> ItemOutcome {
    let person = match api.get_person(&item.cluster_id).await {
        Ok(p) => p,
        Err(e) => {
            return ItemOutcome::Failed(
                classify_api_error(&e, ApplyErrorKind::Other),
                e.to_string(),
            )
        }
    };
    let Some(person) = person else {
        return ItemOutcome::Failed(
            ApplyErrorKind::NotFound,
            format!("cluster {} no longer exists", item.cluster_id),
        );
    };
    if !person.name.trim().is_empty() {
        return ItemOutcome::Failed(
            ApplyErrorKind::AlreadyNamed,
            format!("cluster is already named '{}'", person.name),
        );
    }
    match api.rename_person(&item.cluster_id, &item.src_person_name).await {
        Ok(()) => ItemOutcome::Success(format!("renamed cluster to '{}'", item.src_person_name)),
        Err(e) => ItemOutcome::Failed(classify_api_error(&e, ApplyErrorKind::Other), e.to_string()),
    }
}

/// Reuse-or-create: an existing person with the requested name downgrades
/// creation to reuse, which keeps re-applied batches idempotent.
async fn resolve_person(
    api: &dyn TargetApi,
    name: &str,
) -> Result<String, (ApplyErrorKind, String)> {
    match api.find_person_by_name(name).await {
        Ok(Some(existing)) => {
            info!(person = name, "target person already exists, reusing");
            return Ok(existing.id);
        }
        Ok(None) => {}
        Err(e) => {
            return Err((
                classify_api_error(&e, ApplyErrorKind::CreateFailed),
                e.to_string(),
            ))
        }
    }
    match api.create_person(name).await {
        Ok(created) => Ok(created.id),
        Err(e) => Err((
            classify_api_error(&e, ApplyErrorKind::CreateFailed),
            e.to_string(),
        )),
    }
}

fn classify_api_error(err: &DomainError, fallback: ApplyErrorKind) -> ApplyErrorKind {
    match err {
        DomainError::Timeout(_) => ApplyErrorKind::Timeout,
        DomainError::Network(_) => ApplyErrorKind::Network,
        DomainError::NotFound(_) => ApplyErrorKind::NotFound,
        _ => fallback,
    }
}

fn is_transport(kind: ApplyErrorKind) -> bool {
    matches!(kind, ApplyErrorKind::Network | ApplyErrorKind::Timeout)
}

/// Per-batch bookkeeping: counters, result lists and the progress stream.
struct BatchRun<'a> {
    batch_id: Uuid,
    operation: &'static str,
    total: usize,
    tx: &'a broadcast::Sender<ProgressEvent>,
    results: ApplyResults,
    cancelled: bool,
    terminal_error: Option<String>,
}

impl<'a> BatchRun<'a> {
    fn new(
        tx: &'a broadcast::Sender<ProgressEvent>,
        operation: &'static str,
        labels: &[String],
    ) -> Self {
        let run = Self {
            batch_id: Uuid::new_v4(),
            operation,
            total: labels.len(),
            tx,
            results: ApplyResults::default(),
            cancelled: false,
            terminal_error: None,
        };
        for (index, label) in labels.iter().enumerate() {
            run.emit(index, label, ItemStatus::Pending, None, None);
        }
        run
    }

    fn emit(
        &self,
        index: usize,
        label: &str,
        status: ItemStatus,
        error_kind: Option<ApplyErrorKind>,
        message: Option<String>,
    ) {
        // Nobody listening is fine; the stream is observational.
        let _ = self.tx.send(ProgressEvent {
            batch_id: self.batch_id,
            operation: self.operation.to_string(),
            index,
            total: self.total,
            label: label.to_string(),
            status,
            error_kind,
            message,
            at: Utc::now(),
        });
    }

    fn processing(&self, index: usize, label: &str) {
        self.emit(index, label, ItemStatus::Processing, None, None);
    }

    fn skip(&mut self, index: usize, label: &str, message: &str) {
        self.emit(index, label, ItemStatus::Skipped, None, Some(message.to_string()));
        self.results.skipped.push(ItemResult {
            index,
            label: label.to_string(),
            status: ItemStatus::Skipped,
            error_kind: None,
            message: Some(message.to_string()),
        });
    }

    /// Records one item outcome. Returns true when the batch should be
    /// aborted because the transport has collapsed.
    fn record(
        &mut self,
        index: usize,
        label: &str,
        outcome: ItemOutcome,
        transport_failures: &mut usize,
    ) -> bool {
        match outcome {
            ItemOutcome::Success(message) => {
                *transport_failures = 0;
                self.emit(index, label, ItemStatus::Success, None, Some(message.clone()));
                self.results.success.push(ItemResult {
                    index,
                    label: label.to_string(),
                    status: ItemStatus::Success,
                    error_kind: None,
                    message: Some(message),
                });
                false
            }
            ItemOutcome::Failed(kind, message) => {
                warn!(operation = self.operation, item = label, kind = ?kind, "apply item failed: {}", message);
                self.emit(index, label, ItemStatus::Error, Some(kind), Some(message.clone()));
                self.results.failed.push(ItemResult {
                    index,
                    label: label.to_string(),
                    status: ItemStatus::Error,
                    error_kind: Some(kind),
                    message: Some(message.clone()),
                });
                if is_transport(kind) {
                    *transport_failures += 1;
                    if *transport_failures >= TRANSPORT_COLLAPSE_LIMIT {
                        self.terminal_error = Some(format!(
                            "transport failure persisted across {} consecutive items: {}",
                            transport_failures, message
                        ));
                        return true;
                    }
                } else {
                    *transport_failures = 0;
                }
                false
            }
        }
    }

    /// Marks every item from `from` onward as aborted after a terminal
    /// transport failure.
    fn abort_remaining(&mut self, from: usize, labels: &[String]) {
        for (index, label) in labels.iter().enumerate().skip(from) {
            self.emit(
                index,
                label,
                ItemStatus::Error,
                Some(ApplyErrorKind::Network),
                Some("aborted".to_string()),
            );
            self.results.failed.push(ItemResult {
                index,
                label: label.to_string(),
                status: ItemStatus::Error,
                error_kind: Some(ApplyErrorKind::Network),
                message: Some("aborted".to_string()),
            });
        }
    }

    /// Cancelled batches leave the untouched tail as `pending`; those
    /// items never transition.
    fn mark_remaining_pending(&mut self, from: usize, labels: &[String]) {
        self.cancelled = true;
        for (index, label) in labels.iter().enumerate().skip(from) {
            self.results.pending.push(ItemResult {
                index,
                label: label.to_string(),
                status: ItemStatus::Pending,
                error_kind: None,
                message: None,
            });
        }
    }

    fn finish(self) -> ApplyReport {
        let report = ApplyReport {
            batch_id: self.batch_id,
            operation: self.operation.to_string(),
            total: self.total,
            success_count: self.results.success.len(),
            failed_count: self.results.failed.len(),
            skipped_count: self.results.skipped.len(),
            pending_count: self.results.pending.len(),
            cancelled: self.cancelled,
            terminal_error: self.terminal_error,
            results: self.results,
        };
        info!(
            operation = report.operation,
            total = report.total,
            success = report.success_count,
            failed = report.failed_count,
            skipped = report.skipped_count,
            cancelled = report.cancelled,
            "apply batch finished"
        );
        report
    }
}
