use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Length of one bookable slot.
pub const SLOT_MS: Ms = 30 * 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted ranges.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_half_hour_aligned(&self) -> bool {
        self.start % SLOT_MS == 0 && self.end % SLOT_MS == 0
    }
}

/// Opaque proof of hold ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HoldToken(String);

impl HoldToken {
    /// 128 random bits, hex encoded.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for HoldToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HoldToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for HoldToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Booking/hold state of a slot. A booked slot carries no hold fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Free,
    /// May be past `expires_at`; an expired hold is acquirable but the token
    /// still identifies the last holder until someone else takes the slot.
    Held { token: HoldToken, expires_at: Ms },
    Booked { reference: String },
}

/// A bookable interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: Ulid,
    pub span: Span,
    pub state: SlotState,
}

impl Slot {
    pub fn new(id: Ulid, span: Span) -> Self {
        Self {
            id,
            span,
            state: SlotState::Free,
        }
    }

    pub fn is_booked(&self) -> bool {
        matches!(self.state, SlotState::Booked { .. })
    }

    pub fn client_reference(&self) -> Option<&str> {
        match &self.state {
            SlotState::Booked { reference } => Some(reference),
            _ => None,
        }
    }

    pub fn hold_expiry(&self) -> Option<Ms> {
        match &self.state {
            SlotState::Held { expires_at, .. } => Some(*expires_at),
            _ => None,
        }
    }

    pub fn hold_token(&self) -> Option<&HoldToken> {
        match &self.state {
            SlotState::Held { token, .. } => Some(token),
            _ => None,
        }
    }

    /// Held with a hold that has not yet expired at `now`.
    pub fn is_actively_held(&self, now: Ms) -> bool {
        matches!(self.state, SlotState::Held { expires_at, .. } if expires_at > now)
    }

    /// Unbooked, in the future, and not actively held by anyone.
    pub fn is_acquirable(&self, now: Ms) -> bool {
        !self.is_booked() && !self.is_actively_held(now) && self.span.start > now
    }

    /// Unbooked with a stored token equal to `token`, expired or not.
    pub fn is_held_by(&self, token: &HoldToken) -> bool {
        matches!(&self.state, SlotState::Held { token: t, .. } if t == token)
    }

    /// Apply a slot-scoped event. Events for other slots are ignored.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::HoldAcquired {
                slot_id,
                token,
                expires_at,
            } if *slot_id == self.id => {
                self.state = SlotState::Held {
                    token: token.clone(),
                    expires_at: *expires_at,
                };
            }
            Event::HoldExtended {
                slot_id,
                expires_at,
            } if *slot_id == self.id => {
                if let SlotState::Held { expires_at: e, .. } = &mut self.state {
                    *e = *expires_at;
                }
            }
            Event::HoldReleased { slot_id } if *slot_id == self.id => {
                if !self.is_booked() {
                    self.state = SlotState::Free;
                }
            }
            Event::SlotBooked { slot_id, reference } if *slot_id == self.id => {
                self.state = SlotState::Booked {
                    reference: reference.clone(),
                };
            }
            _ => {}
        }
    }
}

/// Idempotency marker for one purchase attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentRecord {
    pub reference: String,
    /// JSON document describing the purchase.
    pub metadata: String,
    pub is_fulfilled: bool,
    pub created_at: Ms,
}

impl FulfillmentRecord {
    /// Apply a ledger event, including the booking trigger.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::FulfillmentCompleted { reference } if *reference == self.reference => {
                self.is_fulfilled = true;
            }
            Event::SlotBooked { reference, .. } if *reference == self.reference => {
                self.is_fulfilled = true;
            }
            _ => {}
        }
    }
}

/// Flat event log. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        id: Ulid,
        span: Span,
    },
    HoldAcquired {
        slot_id: Ulid,
        token: HoldToken,
        expires_at: Ms,
    },
    HoldExtended {
        slot_id: Ulid,
        expires_at: Ms,
    },
    HoldReleased {
        slot_id: Ulid,
    },
    /// Also flips the matching fulfillment record to fulfilled.
    SlotBooked {
        slot_id: Ulid,
        reference: String,
    },
    FulfillmentOpened {
        reference: String,
        metadata: String,
        is_fulfilled: bool,
        created_at: Ms,
    },
    FulfillmentCompleted {
        reference: String,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A listed bookable slot. `hold_expiry` is set only for an active hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub hold_expiry: Option<Ms>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookOutcome {
    /// This call flipped the slot to booked.
    Booked,
    /// Already booked under the same reference.
    AlreadyBooked,
}

/// Result of trying to take the right to fulfill a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillmentGate {
    AlreadyFulfilled,
    /// Another invocation holds an unexpired claim.
    InProgress,
    Claimed,
}
