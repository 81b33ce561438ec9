use chrono::NaiveDateTime;

/// How an attack roll resolved. Parried and resisted lines collapse into
/// `Miss` since they carry the same defensive information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttackOutcome {
    Hit,
    CriticalHit,
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveKind {
    Fortitude,
    Reflex,
    Will,
}

/// A classified combat log line, produced by the parser and consumed by the
/// ingestion pipeline.
#[derive(Debug, Clone)]
pub enum GameEvent {
    Damage {
        attacker: String,
        target: String,
        total: i32,
        /// Per-type amounts in the order they appeared in the parenthesized
        /// breakdown, e.g. `(30 Physical 20 Fire)`.
        breakdown: Vec<(String, i32)>,
        timestamp: NaiveDateTime,
        /// True when a player filter is configured and the attacker is
        /// someone else.
        filtered_for_player: bool,
    },
    Immunity {
        target: String,
        damage_type: String,
        points: i32,
        timestamp: NaiveDateTime,
    },
    Attack {
        attacker: String,
        target: String,
        outcome: AttackOutcome,
        roll: i32,
        bonus: i32,
        total: i32,
        was_nat1: bool,
        timestamp: NaiveDateTime,
    },
    Save {
        target: String,
        kind: SaveKind,
        bonus: i32,
        timestamp: NaiveDateTime,
    },
}

/// One per-type damage row as stored for target analytics. A multi-type
/// damage line fans out into one of these per breakdown entry.
#[derive(Debug, Clone)]
pub struct DamageEvent {
    pub target: String,
    pub damage_type: String,
    pub immunity_absorbed: i32,
    pub total_dealt: i32,
    pub attacker: String,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct AttackEvent {
    pub attacker: String,
    pub target: String,
    pub outcome: AttackOutcome,
    pub roll: i32,
    pub bonus: i32,
    pub total: i32,
    pub timestamp: NaiveDateTime,
}
