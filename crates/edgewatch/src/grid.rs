//! Fixed 2x2 grid of edge views shown by the center dashboard

use crate::{Edge, EdgeId};

/// Number of simultaneous views
pub const GRID_SLOTS: usize = 4;

/// One cell of the grid
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Edge(Edge),
    Empty,
}

impl Slot {
    pub fn edge_id(&self) -> Option<&EdgeId> {
        match self {
            Slot::Edge(edge) => Some(&edge.id),
            Slot::Empty => None,
        }
    }

    /// Whether this slot should carry a live stream
    pub fn is_live(&self) -> bool {
        matches!(self, Slot::Edge(edge) if edge.is_online())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewGrid {
    slots: [Slot; GRID_SLOTS],
}

impl ViewGrid {
    /// Fill slots with `edges` in listing order; extra edges are not shown
    /// and missing ones leave empty slots.
    pub fn assign(edges: &[Edge]) -> Self {
        let slots = std::array::from_fn(|i| match edges.get(i) {
            Some(edge) => Slot::Edge(edge.clone()),
            None => Slot::Empty,
        });
        Self { slots }
    }

    pub fn slots(&self) -> &[Slot; GRID_SLOTS] {
        &self.slots
    }

    /// Number of slots holding an edge
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| !matches!(s, Slot::Empty)).count()
    }
}
