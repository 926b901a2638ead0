// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 路由表 (Routing Table)
//!
//! 窗口 → 摄像头 的映射。只由流水线修改: 外壳通过 `RoutingHandle` 发送更新请求,
//! 请求在两轮之间统一生效, 一轮内使用同一份快照。

use std::collections::BTreeSet;

use crossbeam_channel::{Receiver, Sender};

use crate::config::Route;
use crate::{DestinationId, RoutingError, SourceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    slots: Vec<Option<SourceId>>,
    version: u64,
}

impl RoutingTable {
    pub fn new(destinations: usize) -> Self {
        Self {
            slots: vec![None; destinations],
            version: 0,
        }
    }

    /// 按初始路由创建; 越界的路由在配置校验时已被拒绝
    pub fn from_routes(destinations: usize, routes: &[Route]) -> Self {
        let mut table = Self::new(destinations);
        for route in routes.iter() {
            if let Some(slot) = table.slots.get_mut(route.destination) {
                *slot = Some(route.source);
            }
        }
        table
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, destination: DestinationId) -> Option<SourceId> {
        self.slots.get(destination).copied().flatten()
    }

    /// 修改一个窗口的映射; 返回映射是否发生变化
    pub fn set(
        &mut self,
        destination: DestinationId,
        source: Option<SourceId>,
    ) -> Result<bool, RoutingError> {
        let destinations = self.slots.len();
        let slot = self
            .slots
            .get_mut(destination)
            .ok_or(RoutingError::UnknownDestination {
                destination,
                destinations,
            })?;
        if *slot == source {
            return Ok(false);
        }
        *slot = source;
        self.version += 1;
        Ok(true)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DestinationId, Option<SourceId>)> + '_ {
        self.slots.iter().copied().enumerate()
    }

    /// 已映射的窗口
    pub fn mapped(&self) -> impl Iterator<Item = (DestinationId, SourceId)> + '_ {
        self.iter().filter_map(|(d, s)| s.map(|s| (d, s)))
    }

    pub fn referenced_sources(&self) -> BTreeSet<SourceId> {
        self.slots.iter().flatten().copied().collect()
    }
}

/// 路由更新请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingUpdate {
    pub destination: DestinationId,
    pub source: Option<SourceId>,
}

/// 外壳侧持有的路由更新入口
#[derive(Debug, Clone)]
pub struct RoutingHandle {
    tx: Sender<RoutingUpdate>,
}

impl RoutingHandle {
    pub(crate) fn new(tx: Sender<RoutingUpdate>) -> Self {
        Self { tx }
    }

    /// 排队一个更新; 流水线已退出时返回 false
    pub fn update(&self, destination: DestinationId, source: Option<SourceId>) -> bool {
        self.tx
            .send(RoutingUpdate {
                destination,
                source,
            })
            .is_ok()
    }
}

/// 取出所有排队的更新
pub(crate) fn drain_updates(rx: &Receiver<RoutingUpdate>) -> Vec<RoutingUpdate> {
    rx.try_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_bumps_version_only_on_change() {
        let mut table = RoutingTable::new(3);
        assert_eq!(table.set(1, Some(4)), Ok(true));
        assert_eq!(table.set(1, Some(4)), Ok(false));
        assert_eq!(table.version(), 1);
        assert_eq!(table.get(1), Some(4));
        assert_eq!(table.get(0), None);
        assert_eq!(table.get(7), None);
    }

    #[test]
    fn test_unknown_destination_is_rejected() {
        let mut table = RoutingTable::new(2);
        assert_eq!(
            table.set(2, Some(0)),
            Err(RoutingError::UnknownDestination {
                destination: 2,
                destinations: 2
            })
        );
        assert_eq!(table.version(), 0);
    }

    #[test]
    fn test_referenced_sources_are_deduplicated() {
        let table = RoutingTable::from_routes(
            3,
            &[
                Route {
                    destination: 0,
                    source: 2,
                },
                Route {
                    destination: 2,
                    source: 2,
                },
            ],
        );
        assert_eq!(table.referenced_sources(), BTreeSet::from([2]));
        assert_eq!(table.mapped().collect::<Vec<_>>(), vec![(0, 2), (2, 2)]);
    }

    #[test]
    fn test_handle_queues_updates() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = RoutingHandle::new(tx);
        assert!(handle.update(0, Some(1)));
        assert!(handle.update(0, None));
        assert_eq!(drain_updates(&rx).len(), 2);
        assert!(drain_updates(&rx).is_empty());
    }
}
