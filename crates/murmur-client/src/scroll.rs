use serde::Serialize;
use tracing::debug;

/// Geometry of the scroll container, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Viewport {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl Viewport {
    pub fn new(scroll_top: f64, scroll_height: f64, client_height: f64) -> Self {
        Self {
            scroll_top,
            scroll_height,
            client_height,
        }
    }

    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollBehavior {
    /// Move instantly (initial load).
    Jump,
    Smooth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScrollDecision {
    pub should_auto_scroll: bool,
    pub behavior: ScrollBehavior,
    /// Show the "new content below" affordance.
    pub show_new_content: bool,
}

/// Decides whether the view follows the tail after the list changes.
///
/// The viewport measured before the change is the only input: a reader
/// who has scrolled up is never moved, however many messages arrive.
#[derive(Debug, Clone)]
pub struct ScrollAnchor {
    threshold: f64,
    loaded: bool,
    new_content_below: bool,
}

impl ScrollAnchor {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            loaded: false,
            new_content_below: false,
        }
    }

    pub fn is_pinned(&self, viewport: &Viewport) -> bool {
        viewport.distance_from_bottom() <= self.threshold
    }

    /// Decide for a list mutation, given the viewport before it.
    pub fn decide(&mut self, before: &Viewport) -> ScrollDecision {
        if !self.loaded {
            self.loaded = true;
            self.new_content_below = false;
            return ScrollDecision {
                should_auto_scroll: true,
                behavior: ScrollBehavior::Jump,
                show_new_content: false,
            };
        }

        let pinned = self.is_pinned(before);
        if !pinned {
            self.new_content_below = true;
        }
        debug!(
            distance = before.distance_from_bottom(),
            pinned, "Scroll decision"
        );
        ScrollDecision {
            should_auto_scroll: pinned,
            behavior: ScrollBehavior::Smooth,
            show_new_content: self.new_content_below,
        }
    }

    /// Record a user scroll. Returns `true` when reaching the bottom
    /// dismissed the "new content" affordance.
    pub fn on_scroll(&mut self, viewport: &Viewport) -> bool {
        if self.new_content_below && self.is_pinned(viewport) {
            self.new_content_below = false;
            return true;
        }
        false
    }

    /// The affordance was clicked.
    pub fn jump_to_latest(&mut self) -> ScrollDecision {
        self.new_content_below = false;
        ScrollDecision {
            should_auto_scroll: true,
            behavior: ScrollBehavior::Smooth,
            show_new_content: false,
        }
    }

    pub fn new_content_below(&self) -> bool {
        self.new_content_below
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded_anchor() -> ScrollAnchor {
        let mut anchor = ScrollAnchor::new(1.0);
        anchor.decide(&Viewport::default());
        anchor
    }

    #[test]
    fn test_initial_load_jumps_even_when_scrolled_up() {
        let mut anchor = ScrollAnchor::new(1.0);
        let decision = anchor.decide(&Viewport::new(0.0, 2000.0, 500.0));
        assert!(decision.should_auto_scroll);
        assert_eq!(decision.behavior, ScrollBehavior::Jump);
        assert!(!decision.show_new_content);
    }

    #[test]
    fn test_one_pixel_from_bottom_follows_tail() {
        let mut anchor = loaded_anchor();
        let decision = anchor.decide(&Viewport::new(499.0, 1000.0, 500.0));
        assert!(decision.should_auto_scroll);
        assert_eq!(decision.behavior, ScrollBehavior::Smooth);
        assert!(!decision.show_new_content);
    }

    #[test]
    fn test_two_pixels_from_bottom_shows_affordance() {
        let mut anchor = loaded_anchor();
        let decision = anchor.decide(&Viewport::new(498.0, 1000.0, 500.0));
        assert!(!decision.should_auto_scroll);
        assert!(decision.show_new_content);
        assert!(anchor.new_content_below());
    }

    #[test]
    fn test_reading_history_is_never_interrupted() {
        let mut anchor = loaded_anchor();
        let reading = Viewport::new(100.0, 5000.0, 500.0);
        for _ in 0..10 {
            assert!(!anchor.decide(&reading).should_auto_scroll);
        }
    }

    #[test]
    fn test_scrolling_to_bottom_clears_affordance() {
        let mut anchor = loaded_anchor();
        anchor.decide(&Viewport::new(0.0, 1000.0, 500.0));
        assert!(!anchor.on_scroll(&Viewport::new(200.0, 1000.0, 500.0)));
        assert!(anchor.new_content_below());
        assert!(anchor.on_scroll(&Viewport::new(500.0, 1000.0, 500.0)));
        assert!(!anchor.new_content_below());
    }

    #[test]
    fn test_jump_to_latest() {
        let mut anchor = loaded_anchor();
        anchor.decide(&Viewport::new(0.0, 1000.0, 500.0));
        let decision = anchor.jump_to_latest();
        assert!(decision.should_auto_scroll);
        assert!(!anchor.new_content_below());
    }
}
