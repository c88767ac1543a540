//! Mark bits stored in every object header.
//!
//! Bits 0 and 1 are the two white shades, bit 2 is black and bit 3 flags an
//! object that has been registered for finalization. An object with neither
//! a white bit nor the black bit is gray.
//!
//! The collector flips the "current" white at the end of each atomic phase.
//! Anything still carrying the previous shade after that flip is dead and is
//! reclaimed by the sweeper.

use std::fmt;

/// First white shade
pub const WHITE0_BIT: u8 = 1 << 0;
/// Second white shade
pub const WHITE1_BIT: u8 = 1 << 1;
/// Black
pub const BLACK_BIT: u8 = 1 << 2;
/// Object is on the finalizer list or queued for finalization
pub const FINALIZED_BIT: u8 = 1 << 3;
/// Both white shades
pub const WHITE_BITS: u8 = WHITE0_BIT | WHITE1_BIT;

const COLOR_BITS: u8 = WHITE_BITS | BLACK_BIT;

/// One of the two alternating white shades
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shade {
    /// Bit 0
    White0,
    /// Bit 1
    White1,
}

impl Shade {
    /// Header bit for this shade
    pub const fn bit(self) -> u8 {
        match self {
            Shade::White0 => WHITE0_BIT,
            Shade::White1 => WHITE1_BIT,
        }
    }

    /// The opposite shade
    pub const fn other(self) -> Shade {
        match self {
            Shade::White0 => Shade::White1,
            Shade::White1 => Shade::White0,
        }
    }
}

/// Tri-color view of a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Not yet reached in this cycle
    White(Shade),
    /// Reached, children not yet scanned
    Gray,
    /// Reached and scanned
    Black,
}

/// The raw mark byte
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Marked(u8);

impl Marked {
    /// A fresh object in the given shade
    pub const fn white(shade: Shade) -> Self {
        Marked(shade.bit())
    }

    /// Reconstruct from raw bits
    pub const fn from_bits(bits: u8) -> Self {
        Marked(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Either white shade is set
    pub const fn is_white(self) -> bool {
        self.0 & WHITE_BITS != 0
    }

    /// Black bit is set
    pub const fn is_black(self) -> bool {
        self.0 & BLACK_BIT != 0
    }

    /// Neither white nor black
    pub const fn is_gray(self) -> bool {
        self.0 & COLOR_BITS == 0
    }

    /// Registered for finalization
    pub const fn is_finalized(self) -> bool {
        self.0 & FINALIZED_BIT != 0
    }

    /// Carries the shade that is *not* current, i.e. was not reached by the
    /// last completed mark phase.
    pub const fn is_dead(self, current: Shade) -> bool {
        self.0 & current.other().bit() != 0
    }

    /// Carries the current shade
    pub const fn is_current_white(self, current: Shade) -> bool {
        self.0 & current.bit() != 0
    }

    /// Decoded color
    pub const fn color(self) -> Color {
        if self.0 & WHITE0_BIT != 0 {
            Color::White(Shade::White0)
        } else if self.0 & WHITE1_BIT != 0 {
            Color::White(Shade::White1)
        } else if self.0 & BLACK_BIT != 0 {
            Color::Black
        } else {
            Color::Gray
        }
    }

    /// Swap to the other white shade
    pub fn change_white(&mut self) {
        self.0 ^= WHITE_BITS;
    }

    pub(crate) fn white_to_gray(&mut self) {
        self.0 &= !WHITE_BITS;
    }

    pub(crate) fn black_to_gray(&mut self) {
        self.0 &= !BLACK_BIT;
    }

    pub(crate) fn gray_to_black(&mut self) {
        self.0 |= BLACK_BIT;
    }

    /// Reset to the current white, keeping the finalization flag
    pub(crate) fn make_white(&mut self, current: Shade) {
        self.0 = (self.0 & !COLOR_BITS) | current.bit();
    }

    pub(crate) fn set_finalized(&mut self) {
        self.0 |= FINALIZED_BIT;
    }

    pub(crate) fn clear_finalized(&mut self) {
        self.0 &= !FINALIZED_BIT;
    }
}

impl fmt::Debug for Marked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Marked");
        out.field("color", &self.color());
        if self.is_finalized() {
            out.field("finalized", &true);
        }
        out.finish()
    }
}
