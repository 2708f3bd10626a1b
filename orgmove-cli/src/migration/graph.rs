//! Execution and query ordering for migration tasks
//!
//! Tasks are placed one at a time: the classification entity pins index 0,
//! read-only entities stay contiguous behind it, and every other entity is
//! inserted just before the first existing task that looks up to it. A
//! bounded relaxation then pulls master-detail parents ahead of their
//! children. Degenerate or cyclic master-detail declarations may not fully
//! converge within the pass limit; the loop stops rather than diverging.

use super::task::MigrationTask;

/// Upper bound on master-detail relaxation passes
pub const MAX_ORDER_PASSES: usize = 10;

/// Arrange tasks into execution order
pub fn execution_order(tasks: Vec<MigrationTask>) -> Vec<MigrationTask> {
    let mut ordered: Vec<MigrationTask> = Vec::with_capacity(tasks.len());
    // Length of the special prefix: classification entity plus read-only tasks
    let mut special_len = 0;

    for task in tasks {
        if task.descriptor.is_classification() {
            ordered.insert(0, task);
            special_len += 1;
            continue;
        }
        if task.descriptor.is_readonly() {
            ordered.insert(special_len, task);
            special_len += 1;
            continue;
        }

        // Scan backward to the special-prefix boundary, keeping the smallest
        // index of a task that lists this entity as a parent lookup
        let mut insert_at = None;
        for index in (special_len..ordered.len()).rev() {
            if ordered[index]
                .descriptor
                .parent_lookup_entities()
                .contains(task.name())
            {
                insert_at = Some(index);
            }
        }
        match insert_at {
            Some(index) => ordered.insert(index, task),
            None => ordered.push(task),
        }
    }

    relax_master_detail(&mut ordered);
    ordered
}

/// Pull master-detail parents ahead of their children, at most
/// [`MAX_ORDER_PASSES`] times, stopping early on a pass with no moves.
fn relax_master_detail(ordered: &mut Vec<MigrationTask>) {
    for _ in 0..MAX_ORDER_PASSES {
        let mut moved = false;
        let mut child = 0;
        while child < ordered.len() {
            let mut candidate = child + 1;
            let mut moved_here = false;
            while candidate < ordered.len() {
                let is_parent = ordered[child]
                    .descriptor
                    .parent_master_detail_entities()
                    .contains(ordered[candidate].name());
                if is_parent {
                    let parent = ordered.remove(candidate);
                    ordered.insert(child, parent);
                    moved = true;
                    moved_here = true;
                    break;
                }
                candidate += 1;
            }
            // After a move the child shifted one slot right; either way the
            // scan advances to keep each pass bounded
            child += if moved_here { 2 } else { 1 };
        }
        if !moved {
            break;
        }
    }
}

/// Derive query order from execution order: process-all and limited-query
/// tasks first, the rest after, both groups keeping execution order.
pub fn query_order(ordered: &[MigrationTask]) -> Vec<usize> {
    let prioritized = |task: &MigrationTask| {
        task.descriptor.process_all_source
            || task.descriptor.process_all_target
            || task.descriptor.has_limited_query()
    };

    let mut order: Vec<usize> = (0..ordered.len())
        .filter(|&i| prioritized(&ordered[i]))
        .collect();
    order.extend((0..ordered.len()).filter(|&i| !prioritized(&ordered[i])));
    order
}
