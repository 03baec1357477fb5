use std::collections::HashSet;

use dashmap::DashMap;
use domain::{CellId, UserId};

/// 网格单元 → 看护者 ID 集合。
///
/// 不变量：每个在线看护者恰好出现在其当前位置所在的单元中。
/// 所有修改都由 [`crate::PresenceRegistry`] 在持有该看护者条目锁时执行，
/// 锁顺序固定为 注册表条目 → 网格单元，查询路径不会反向加锁。
#[derive(Debug, Default)]
pub struct GeoIndex {
    cells: DashMap<CellId, HashSet<UserId>>,
}

impl GeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cell: CellId, sitter_id: UserId) {
        self.cells.entry(cell).or_default().insert(sitter_id);
    }

    pub fn remove(&self, cell: CellId, sitter_id: UserId) {
        if let Some(mut members) = self.cells.get_mut(&cell) {
            members.remove(&sitter_id);
        }
        self.cells.remove_if(&cell, |_, members| members.is_empty());
    }

    pub fn relocate(&self, sitter_id: UserId, from: CellId, to: CellId) {
        if from == to {
            return;
        }
        self.remove(from, sitter_id);
        self.insert(to, sitter_id);
    }

    /// 单元内成员的快照
    pub fn members(&self, cell: CellId) -> Vec<UserId> {
        self.cells
            .get(&cell)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}
