//! Tri-color marking states for the value heap
//!
//! - White: potentially unreachable, reclaimed by the sweep
//! - Gray: reachable but its fields are not yet scanned
//! - Black: reachable and fully scanned

/// The color of a heap cell in the tri-color marking algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Color {
    /// Potentially unreachable, candidate for collection
    #[default]
    White = 0,
    /// Reachable but not yet scanned
    Gray = 1,
    /// Reachable and fully scanned
    Black = 2,
}

impl Color {
    #[inline]
    pub fn is_white(self) -> bool {
        self == Color::White
    }

    /// Shade a white cell gray. Returns `true` if the cell still needs scanning.
    #[inline]
    pub fn mark_white_to_gray(&mut self) -> bool {
        if *self == Color::White {
            *self = Color::Gray;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn mark_black(&mut self) {
        *self = Color::Black;
    }

    #[inline]
    pub fn reset_white(&mut self) {
        *self = Color::White;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn white_to_gray_only_once() {
        let mut color = Color::default();
        assert!(color.is_white());
        assert!(color.mark_white_to_gray());
        assert!(!color.mark_white_to_gray());
        color.mark_black();
        assert!(!color.mark_white_to_gray());
        color.reset_white();
        assert!(color.is_white());
    }
}
