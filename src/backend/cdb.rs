use crate::backend::reservation_station::{RSState, RSTable, StationTag};
use crate::instructions::instructions::{RegisterType, StationClass, WordType};

/// A result placed on the common data bus.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct CDBBroadcast {
    pub(crate) tag: StationTag,
    pub(crate) seq: u64,
    pub(crate) sink: Option<RegisterType>,
    pub(crate) value: WordType,
}

/// The outcome of arbitrating one class port for a single cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) struct Arbitration {
    pub(crate) winner: Option<u16>,
    // completed results that lost the port and retry next cycle
    pub(crate) deferred: usize,
    // completed stores still waiting for their data operand
    pub(crate) awaiting_data: usize,
}

/// The common data bus. Every station class owns one write port, so at most one
/// result per class is broadcast per cycle.
pub(crate) struct CDB {
    cdb_broadcast_buffer: Vec<CDBBroadcast>,
}

impl CDB {
    pub(crate) fn new() -> Self {
        CDB { cdb_broadcast_buffer: Vec::with_capacity(StationClass::ALL.len()) }
    }

    /// Picks the station of `table` that owns the port in cycle `now`: the lowest
    /// index among completed, non-speculative stations whose result was computed in an
    /// earlier cycle.
    pub(crate) fn arbitrate(table: &RSTable, now: u64) -> Arbitration {
        let mut arbitration = Arbitration::default();

        for rs in table.iter() {
            if rs.state != RSState::COMPLETED || rs.completed_cycle >= now || rs.speculative {
                continue;
            }

            if table.class == StationClass::STORE && !rs.operand_available(1, now) {
                arbitration.awaiting_data += 1;
                continue;
            }

            if arbitration.winner.is_none() {
                arbitration.winner = Some(rs.tag.index);
            } else {
                arbitration.deferred += 1;
            }
        }

        arbitration
    }

    pub(crate) fn push(&mut self, broadcast: CDBBroadcast) {
        self.cdb_broadcast_buffer.push(broadcast);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cdb_broadcast_buffer.is_empty()
    }

    /// Drains the broadcasts of this cycle in program order.
    pub(crate) fn take(&mut self) -> Vec<CDBBroadcast> {
        let mut broadcasts: Vec<CDBBroadcast> = self.cdb_broadcast_buffer.drain(..).collect();
        broadcasts.sort_by_key(|broadcast| broadcast.seq);
        broadcasts
    }

    pub(crate) fn flush(&mut self) {
        self.cdb_broadcast_buffer.clear();
    }
}
