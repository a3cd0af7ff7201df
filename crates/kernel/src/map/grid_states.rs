//! Per-state grid handlers, dispatched through a table indexed by state.
//!
//! These handlers are the only code that moves a grid between `Active`,
//! `Idle` and `Removal`; creation sets `Idle` and unload frees the slot.

use worldgrid_common::ObjectGuid;
use worldgrid_stream::{GridCoord, GridState};

use super::Map;
use crate::context::SimContext;

type StateHandler = fn(&mut Map, &SimContext, GridCoord, u32);

const HANDLERS: [StateHandler; GridState::COUNT] = [invalid_state, active_state, idle_state, removal_state];

impl Map {
    /// Run the handler for every created grid. A grid freed by an earlier
    /// handler is skipped.
    pub(super) fn update_grid_states(&mut self, ctx: &SimContext, diff_ms: u32) {
        let coords: Vec<GridCoord> = self.grids().map(|g| g.coord()).collect();
        for coord in coords {
            let Some(grid) = self.grid(coord) else {
                continue;
            };
            HANDLERS[grid.state().index()](self, ctx, coord, diff_ms);
        }
    }

    /// Stop combat of every creature in the grid.
    fn stop_grid_creatures(&mut self, coord: GridCoord) {
        let residents: Vec<ObjectGuid> = self.grid(coord).map(|g| g.objects().collect()).unwrap_or_default();
        for guid in residents {
            if let Some(obj) = self.objects.get_mut(&guid) {
                obj.combat_stop();
            }
        }
    }
}

fn invalid_state(map: &mut Map, _ctx: &SimContext, coord: GridCoord, _diff_ms: u32) {
    tracing::error!(map = map.id, %coord, "created grid in invalid state");
    debug_assert!(false, "grid in invalid state");
}

/// Every tenth of the expiry, check whether anything still keeps the grid busy.
fn active_state(map: &mut Map, _ctx: &SimContext, coord: GridCoord, diff_ms: u32) {
    let Some(grid) = map.grid_mut(coord) else {
        return;
    };
    grid.info_mut().update_timer(u64::from(diff_ms));
    if !grid.info().timer().passed() {
        return;
    }
    if !map.active_objects_in_grid(coord) && !map.active_objects_near_grid(coord) {
        map.stop_grid_creatures(coord);
        tracing::trace!(map = map.id, %coord, "grid went idle");
        map.set_grid_state(coord, GridState::Idle);
    } else {
        map.reset_grid_expiry(coord, 0.1);
    }
}

fn idle_state(map: &mut Map, _ctx: &SimContext, coord: GridCoord, _diff_ms: u32) {
    map.reset_grid_expiry(coord, 1.0);
    map.set_grid_state(coord, GridState::Removal);
}

fn removal_state(map: &mut Map, ctx: &SimContext, coord: GridCoord, diff_ms: u32) {
    if map.grid_unload_lock(ctx, coord) {
        return;
    }
    let Some(grid) = map.grid_mut(coord) else {
        return;
    };
    grid.info_mut().update_timer(u64::from(diff_ms));
    if !grid.info().timer().passed() {
        return;
    }
    if !map.unload_grid(ctx, coord, false) {
        map.reset_grid_expiry(coord, 1.0);
    }
}
