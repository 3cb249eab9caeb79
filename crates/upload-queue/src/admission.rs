use crate::item::{UploadItem, UploadStatus};

/// Picks the waiting items to admit into free slots.
///
/// Returns up to `limit - active` ids of `Waiting` items, lowest id first,
/// or nothing while the queue is globally paused.
pub fn try_admit<'a>(
    items: impl IntoIterator<Item = &'a UploadItem>,
    active: usize,
    limit: usize,
    global_paused: bool,
) -> Vec<u64> {
    let slots = limit.saturating_sub(active);
    if global_paused || slots == 0 {
        return Vec::new();
    }

    let mut waiting: Vec<u64> = items
        .into_iter()
        .filter(|item| item.status() == UploadStatus::Waiting)
        .map(|item| item.id())
        .collect();
    waiting.sort_unstable();
    waiting.truncate(slots);
    waiting
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_transfer::MemorySource;
    use std::sync::Arc;

    fn items(statuses: &[(u64, UploadStatus)]) -> Vec<UploadItem> {
        statuses
            .iter()
            .map(|(id, status)| {
                let mut item = UploadItem::new(*id, Arc::new(MemorySource::new("f", vec![0; 4])));
                match status {
                    UploadStatus::Waiting => {}
                    UploadStatus::Active => {
                        item.transition(UploadStatus::Active);
                    }
                    UploadStatus::Paused => {
                        item.transition(UploadStatus::Active);
                        item.transition(UploadStatus::Paused);
                    }
                    UploadStatus::Error => {
                        item.transition(UploadStatus::Active);
                        item.transition(UploadStatus::Error);
                    }
                }
                item
            })
            .collect()
    }

    #[test]
    fn admits_oldest_waiting_first() {
        use UploadStatus::*;
        let items = items(&[(5, Waiting), (2, Waiting), (3, Paused), (9, Waiting)]);
        assert_eq!(try_admit(&items, 0, 2, false), vec![2, 5]);
    }

    #[test]
    fn respects_free_slots() {
        use UploadStatus::*;
        let items = items(&[(1, Active), (2, Active), (3, Waiting), (4, Waiting)]);
        assert_eq!(try_admit(&items, 2, 3, false), vec![3]);
        assert!(try_admit(&items, 2, 2, false).is_empty());
        assert!(try_admit(&items, 5, 2, false).is_empty());
    }

    #[test]
    fn nothing_while_paused() {
        let items = items(&[(1, UploadStatus::Waiting)]);
        assert!(try_admit(&items, 0, 3, true).is_empty());
    }

    #[test]
    fn skips_error_and_paused() {
        use UploadStatus::*;
        let items = items(&[(1, Error), (2, Paused)]);
        assert!(try_admit(&items, 0, 3, false).is_empty());
    }
}
