use crate::core::model::{Task, TaskOrder, TaskStatus};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub order: TaskOrder,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// The mirror was replaced and consumers must re-render.
    pub changed: bool,
    pub transitions: Vec<StatusTransition>,
    /// Orders reported `running` by this snapshot, whether or not it changed anything.
    pub running: BTreeSet<TaskOrder>,
    pub dropped_selection: Vec<TaskOrder>,
}

/// What a task looked like before an optimistic mark, for rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorState {
    pub order: TaskOrder,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub progress: Option<u8>,
}

/// Local mirror of the remote task list plus operator selection.
///
/// The mirror is kept sorted by `order` with one entry per order. A
/// snapshot replaces it wholesale when it differs in count or in any
/// task's `(order, status, last_execute_time)`; otherwise it is left alone.
#[derive(Debug, Default)]
pub struct Reconciler {
    tasks: Vec<Task>,
    selection: BTreeSet<TaskOrder>,
}

pub fn normalize(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by_key(|t| t.order);
    tasks.dedup_by_key(|t| t.order);
    tasks
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, order: TaskOrder) -> Option<&Task> {
        self.index_of(order).map(|i| &self.tasks[i])
    }

    fn index_of(&self, order: TaskOrder) -> Option<usize> {
        self.tasks.binary_search_by_key(&order, |t| t.order).ok()
    }

    pub fn reconcile(&mut self, incoming: Vec<Task>) -> ReconcileReport {
        let incoming = normalize(incoming);
        let running = incoming
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.order)
            .collect();

        let changed = incoming.len() != self.tasks.len()
            || self.tasks.iter().zip(&incoming).any(|(old, new)| !old.same_observed_state(new));

        if !changed {
            return ReconcileReport { changed: false, running, ..ReconcileReport::default() };
        }

        let transitions = incoming
            .iter()
            .filter_map(|new| {
                let old = self.get(new.order)?;
                (old.status != new.status).then(|| StatusTransition {
                    order: new.order,
                    from: old.status,
                    to: new.status,
                    message: new.message.clone(),
                })
            })
            .collect();

        self.tasks = incoming;
        let dropped_selection = self.prune_selection();

        ReconcileReport { changed: true, transitions, running, dropped_selection }
    }

    fn prune_selection(&mut self) -> Vec<TaskOrder> {
        let gone: Vec<TaskOrder> = self
            .selection
            .iter()
            .copied()
            .filter(|o| self.index_of(*o).is_none())
            .collect();
        for o in &gone {
            self.selection.remove(o);
        }
        gone
    }

    /// Optimistically flag a task as running. Returns what it was before, or
    /// `None` for an order the mirror does not know.
    pub fn mark_running(&mut self, order: TaskOrder, message: &str) -> Option<PriorState> {
        let i = self.index_of(order)?;
        let t = &mut self.tasks[i];
        let prior = PriorState { order, status: t.status, message: t.message.clone(), progress: t.progress };
        t.status = TaskStatus::Running;
        t.message = Some(message.to_string());
        t.progress = Some(0);
        Some(prior)
    }

    /// Undo an optimistic mark, unless a snapshot has already replaced it.
    pub fn restore(&mut self, prior: &PriorState) -> bool {
        let Some(i) = self.index_of(prior.order) else {
            return false;
        };
        let t = &mut self.tasks[i];
        if t.status != TaskStatus::Running {
            return false;
        }
        t.status = prior.status;
        t.message = prior.message.clone();
        t.progress = prior.progress;
        true
    }

    /// Local insert after an accepted add command; the next snapshot decides
    /// what the server actually assigned.
    pub fn insert_optimistic(&mut self, mut task: Task) -> TaskOrder {
        let order = self.tasks.last().map(|t| t.order + 1).unwrap_or(1);
        task.order = order;
        task.status = TaskStatus::Normal;
        self.tasks.push(task);
        order
    }

    pub fn select(&mut self, order: TaskOrder) -> bool {
        self.index_of(order).is_some() && self.selection.insert(order)
    }

    pub fn unselect(&mut self, order: TaskOrder) -> bool {
        self.selection.remove(&order)
    }

    pub fn toggle(&mut self, order: TaskOrder) -> bool {
        if self.selection.remove(&order) {
            false
        } else {
            self.select(order)
        }
    }

    pub fn select_all(&mut self) {
        self.selection.extend(self.tasks.iter().map(|t| t.order));
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    pub fn selection(&self) -> Vec<TaskOrder> {
        self.selection.iter().copied().collect()
    }

    pub fn selected_tasks(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| self.selection.contains(&t.order))
            .cloned()
            .collect()
    }

    pub fn categories(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for c in self.tasks.iter().filter_map(|t| t.category.as_deref()).filter(|c| !c.is_empty()) {
            if !seen.iter().any(|s: &String| s == c) {
                seen.push(c.to_string());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::task;

    fn with_time(mut t: Task, ts: i64) -> Task {
        t.last_execute_time = Some(ts);
        t
    }

    #[test]
    fn reordered_identical_snapshot_is_not_a_change() {
        let mut r = Reconciler::new();
        let first = r.reconcile(vec![task(2, TaskStatus::Normal), task(1, TaskStatus::Success)]);
        assert!(first.changed);
        assert_eq!(r.tasks().iter().map(|t| t.order).collect::<Vec<_>>(), vec![1, 2]);

        let mut again = task(1, TaskStatus::Success);
        again.message = Some("different text is not diffed".into());
        let second = r.reconcile(vec![task(2, TaskStatus::Normal), again]);
        assert!(!second.changed);
        assert!(second.transitions.is_empty());
        assert_eq!(r.get(1).unwrap().message, None);
    }

    #[test]
    fn status_change_replaces_whole_mirror_sorted() {
        let mut r = Reconciler::new();
        r.reconcile(vec![task(1, TaskStatus::Running), task(2, TaskStatus::Normal)]);

        let mut done = with_time(task(1, TaskStatus::Success), 1_700_000_000);
        done.progress = Some(100);
        let report = r.reconcile(vec![task(2, TaskStatus::Normal), done]);
        assert!(report.changed);
        assert_eq!(r.tasks()[0].status, TaskStatus::Success);
        assert_eq!(r.tasks()[0].progress, Some(100));
        assert_eq!(
            report.transitions,
            vec![StatusTransition { order: 1, from: TaskStatus::Running, to: TaskStatus::Success, message: None }]
        );
        assert!(report.running.is_empty());
    }

    #[test]
    fn last_execute_time_alone_is_a_change() {
        let mut r = Reconciler::new();
        r.reconcile(vec![task(1, TaskStatus::Normal)]);
        let report = r.reconcile(vec![with_time(task(1, TaskStatus::Normal), 5)]);
        assert!(report.changed);
        assert!(report.transitions.is_empty());
    }

    #[test]
    fn count_change_always_replaces() {
        let mut r = Reconciler::new();
        r.reconcile(vec![task(1, TaskStatus::Normal), task(2, TaskStatus::Normal)]);
        assert!(r.reconcile(vec![task(1, TaskStatus::Normal)]).changed);
        assert_eq!(r.tasks().len(), 1);
    }

    #[test]
    fn duplicate_orders_collapse_to_one() {
        let mut r = Reconciler::new();
        r.reconcile(vec![task(1, TaskStatus::Normal), task(1, TaskStatus::Error), task(3, TaskStatus::Normal)]);
        assert_eq!(r.tasks().len(), 2);
    }

    #[test]
    fn running_is_reported_even_without_change() {
        let mut r = Reconciler::new();
        r.reconcile(vec![task(1, TaskStatus::Running)]);
        let report = r.reconcile(vec![task(1, TaskStatus::Running)]);
        assert!(!report.changed);
        assert_eq!(report.running.into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn selection_survives_unless_order_disappears() {
        let mut r = Reconciler::new();
        r.reconcile(vec![task(1, TaskStatus::Normal), task(2, TaskStatus::Normal), task(3, TaskStatus::Normal)]);
        r.select(1);
        r.select(3);
        assert!(!r.select(9));

        let report = r.reconcile(vec![task(1, TaskStatus::Error), task(2, TaskStatus::Normal)]);
        assert_eq!(report.dropped_selection, vec![3]);
        assert_eq!(r.selection(), vec![1]);
        assert_eq!(r.selected_tasks()[0].status, TaskStatus::Error);
    }

    #[test]
    fn optimistic_mark_and_restore() {
        let mut r = Reconciler::new();
        let mut t = task(1, TaskStatus::Error);
        t.message = Some("old".into());
        r.reconcile(vec![t]);

        let prior = r.mark_running(1, "executing").unwrap();
        assert_eq!(r.get(1).unwrap().status, TaskStatus::Running);
        assert!(r.mark_running(7, "executing").is_none());

        assert!(r.restore(&prior));
        let t = r.get(1).unwrap();
        assert_eq!((t.status, t.message.as_deref()), (TaskStatus::Error, Some("old")));
    }

    #[test]
    fn restore_does_not_clobber_newer_snapshot() {
        let mut r = Reconciler::new();
        r.reconcile(vec![task(1, TaskStatus::Normal)]);
        let prior = r.mark_running(1, "executing").unwrap();
        r.reconcile(vec![task(1, TaskStatus::Success)]);
        assert!(!r.restore(&prior));
        assert_eq!(r.get(1).unwrap().status, TaskStatus::Success);
    }

    #[test]
    fn optimistic_insert_takes_next_order() {
        let mut r = Reconciler::new();
        r.reconcile(vec![task(1, TaskStatus::Normal), task(4, TaskStatus::Running)]);
        assert_eq!(r.insert_optimistic(task(0, TaskStatus::Error)), 5);
        assert_eq!(r.get(5).unwrap().status, TaskStatus::Normal);

        let mut empty = Reconciler::new();
        assert_eq!(empty.insert_optimistic(task(0, TaskStatus::Normal)), 1);
    }

    #[test]
    fn categories_are_distinct_in_mirror_order() {
        let mut r = Reconciler::new();
        let mk = |o, c: &str| {
            let mut t = task(o, TaskStatus::Normal);
            t.category = Some(c.to_string());
            t
        };
        r.reconcile(vec![mk(1, "tv"), mk(2, "movies"), mk(3, "tv")]);
        assert_eq!(r.categories(), vec!["tv".to_string(), "movies".to_string()]);
    }

    #[test]
    fn toggle_flips_membership() {
        let mut r = Reconciler::new();
        r.reconcile(vec![task(1, TaskStatus::Normal)]);
        assert!(r.toggle(1));
        assert!(!r.toggle(1));
        r.select_all();
        assert_eq!(r.selection(), vec![1]);
        r.clear_selection();
        assert!(r.selection().is_empty());
    }
}
