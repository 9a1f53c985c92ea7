//! Deck identifiers.

use std::fmt;

/// One of the two playback slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeckId {
    #[default]
    A,
    B,
}

impl DeckId {
    /// Both decks, in index order.
    pub const ALL: [Self; 2] = [Self::A, Self::B];

    /// The other deck.
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Array index for per-deck storage.
    pub const fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    /// Inverse of [`DeckId::index`]; anything other than 1 maps to A.
    pub const fn from_index(index: usize) -> Self {
        if index == 1 {
            Self::B
        } else {
            Self::A
        }
    }
}

impl fmt::Display for DeckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

/// Which deck a load command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeckSelector {
    /// A specific deck.
    Deck(DeckId),
    /// Whichever deck is currently audible.
    #[default]
    Active,
    /// The deck that will play next (the inactive one).
    Next,
}

impl DeckSelector {
    /// Resolve against the currently active deck.
    pub const fn resolve(self, active: DeckId) -> DeckId {
        match self {
            Self::Deck(deck) => deck,
            Self::Active => active,
            Self::Next => active.other(),
        }
    }
}

impl From<DeckId> for DeckSelector {
    fn from(deck: DeckId) -> Self {
        Self::Deck(deck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_other_and_index() {
        assert_eq!(DeckId::A.other(), DeckId::B);
        assert_eq!(DeckId::B.other(), DeckId::A);
        for deck in DeckId::ALL {
            assert_eq!(DeckId::from_index(deck.index()), deck);
        }
    }

    #[test]
    fn test_selector_resolve() {
        assert_eq!(DeckSelector::Active.resolve(DeckId::B), DeckId::B);
        assert_eq!(DeckSelector::Next.resolve(DeckId::B), DeckId::A);
        assert_eq!(DeckSelector::from(DeckId::A).resolve(DeckId::B), DeckId::A);
    }
}
