//! Combat log line classifier.
//!
//! Lines are matched against the known grammars in a fixed order: damage,
//! then damage immunity, then the attack family, then saving throws. The
//! first grammar that fully extracts wins; anything else is chatter and
//! classifies to nothing. Parsing is byte-offset based rather than
//! pattern-compiled, so unmatched lines bail out on the first missing
//! landmark.

use chrono::{Local, NaiveDateTime, NaiveTime};
use memchr::memchr;
use memchr::memmem;

use crate::estimators::TrackerRegistry;
use crate::event_models::{AttackOutcome, GameEvent, SaveKind};

#[cfg(test)]
mod tests;

const CHAT_MARKER: &str = "[CHAT WINDOW TEXT]";
const DAMAGES_MARKER: &str = " damages ";
const IMMUNITY_MARKER: &str = " : Damage Immunity absorbs ";
const ATTACKS_MARKER: &str = " attacks ";

/// Stateful classifier. Holds the estimator registry plus the damage
/// context used to re-synchronize multi-type immunity lines.
pub struct LogParser {
    pub player_name: Option<String>,
    pub parse_immunity: bool,
    pub trackers: TrackerRegistry,
    current_target: Option<String>,
    current_damage_types: Vec<(String, i32)>,
    current_processing_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawOutcome {
    Hit,
    CriticalHit,
    Miss,
    Parried,
    Resisted,
    /// `*attacker miss chance: NN%*`, a concealment roll that failed.
    MissChance,
}

struct AttackLine {
    attacker: String,
    target: String,
    outcome: RawOutcome,
    roll: Option<(i32, i32, i32)>,
}

/// Attack grammars in match order. The threat-roll form subsumes the plain
/// form, and the concealment form interleaves the roll between two starred
/// groups, so each line settles on the first extractor that accepts it.
const ATTACK_GRAMMARS: [fn(&str) -> Option<AttackLine>; 3] = [
    attack_with_threat_roll,
    attack_with_concealment,
    attack_plain,
];

impl LogParser {
    pub fn new(player_name: Option<String>, parse_immunity: bool) -> Self {
        Self {
            player_name,
            parse_immunity,
            trackers: TrackerRegistry::new(),
            current_target: None,
            current_damage_types: Vec::new(),
            current_processing_type: None,
        }
    }

    /// Classify one log line. Returns `None` for chatter and for lines the
    /// grammars reject partway through.
    pub fn parse_line(&mut self, line: &str) -> Option<GameEvent> {
        if line.trim().is_empty() {
            return None;
        }
        let timestamp = extract_timestamp(line).unwrap_or_else(|| Local::now().naive_local());
        if let Some(event) = self.try_damage(line, timestamp) {
            return Some(event);
        }
        if self.parse_immunity
            && let Some(event) = self.try_immunity(line, timestamp)
        {
            return Some(event);
        }
        let stripped = strip_chat_prefix(line).unwrap_or(line);
        if let Some(event) = self.try_attack(stripped, timestamp) {
            return Some(event);
        }
        self.try_save(stripped, timestamp)
    }

    pub fn reset_context(&mut self) {
        self.current_target = None;
        self.current_damage_types.clear();
        self.current_processing_type = None;
    }

    fn try_damage(&mut self, line: &str, timestamp: NaiveDateTime) -> Option<GameEvent> {
        let rest = strip_chat_prefix(line)?;
        let pos = memmem::find(rest.as_bytes(), DAMAGES_MARKER.as_bytes())?;
        let attacker = rest[..pos].trim();
        if attacker.is_empty() {
            return None;
        }
        let after = &rest[pos + DAMAGES_MARKER.len()..];
        let colon = memchr(b':', after.as_bytes())?;
        let target = after[..colon].trim();
        if target.is_empty() {
            return None;
        }
        let tail = &after[colon + 1..];
        let open = memchr(b'(', tail.as_bytes())?;
        let close = memchr(b')', tail.as_bytes())?;
        if close < open {
            return None;
        }
        let total: i32 = tail[..open].trim().parse().ok()?;
        let breakdown = parse_damage_breakdown(&tail[open + 1..close]);

        // Remember the breakdown so trailing immunity lines can be matched
        // back to the damage type they absorbed from.
        self.current_target = Some(target.to_string());
        self.current_damage_types = breakdown.clone();
        self.current_processing_type = breakdown.first().map(|(t, _)| t.clone());

        let filtered_for_player = self
            .player_name
            .as_deref()
            .is_some_and(|player| player != attacker);
        Some(GameEvent::Damage {
            attacker: attacker.to_string(),
            target: target.to_string(),
            total,
            breakdown,
            timestamp,
            filtered_for_player,
        })
    }

    fn try_immunity(&mut self, line: &str, timestamp: NaiveDateTime) -> Option<GameEvent> {
        let rest = strip_chat_prefix(line)?;
        let pos = memmem::find(rest.as_bytes(), IMMUNITY_MARKER.as_bytes())?;
        let target = rest[..pos].trim();
        if target.is_empty() {
            return None;
        }
        let after = rest[pos + IMMUNITY_MARKER.len()..].trim_start();
        let space = after.find(' ')?;
        let points: i32 = after[..space].parse().ok()?;
        let tail = after[space..].trim_start();
        // "point", "points", or "point(s)".
        if !tail.starts_with("point") {
            return None;
        }
        let of = memmem::find(tail.as_bytes(), b" of ")?;
        let damage_type = tail[of + 4..].trim();
        if damage_type.is_empty() {
            return None;
        }

        if self.current_target.as_deref() == Some(target)
            && let Some((known, _)) = self
                .current_damage_types
                .iter()
                .find(|(t, _)| t == damage_type)
        {
            self.current_processing_type = Some(known.clone());
        }

        Some(GameEvent::Immunity {
            target: target.to_string(),
            damage_type: damage_type.to_string(),
            points,
            timestamp,
        })
    }

    fn try_attack(&mut self, stripped: &str, timestamp: NaiveDateTime) -> Option<GameEvent> {
        let line = ATTACK_GRAMMARS
            .iter()
            .find_map(|grammar| grammar(stripped))?;
        // Outcome-only lines carry no numbers worth recording.
        let (roll, bonus, total) = line.roll?;

        let was_nat1 = roll == 1;
        let was_nat20 = roll == 20;
        let is_hit = matches!(line.outcome, RawOutcome::Hit | RawOutcome::CriticalHit);
        // Only a failed miss-chance roll bypasses armor class; a plain miss
        // on a concealed target still lost to AC and bounds it.
        let is_concealment = line.outcome == RawOutcome::MissChance;

        if is_hit {
            self.trackers
                .defense_mut(&line.target)
                .record_hit(total, was_nat20);
        } else {
            self.trackers
                .defense_mut(&line.target)
                .record_miss(total, was_nat1, is_concealment);
        }
        self.trackers
            .attack_bonus_mut(&line.attacker)
            .record_bonus(bonus);

        let outcome = match line.outcome {
            RawOutcome::Hit => AttackOutcome::Hit,
            RawOutcome::CriticalHit => AttackOutcome::CriticalHit,
            _ => AttackOutcome::Miss,
        };
        Some(GameEvent::Attack {
            attacker: line.attacker,
            target: line.target,
            outcome,
            roll,
            bonus,
            total,
            was_nat1,
            timestamp,
        })
    }

    fn try_save(&mut self, stripped: &str, timestamp: NaiveDateTime) -> Option<GameEvent> {
        let s = stripped.trim_start();
        // get() instead of slicing: a multi-byte character at byte 5 must
        // not panic on this path, which every unrecognized line reaches.
        let s = match s.get(..5) {
            Some(prefix) if prefix.eq_ignore_ascii_case("SAVE:") => s[5..].trim_start(),
            _ => s,
        };
        let colon = memchr(b':', s.as_bytes())?;
        let target = s[..colon].trim();
        if target.is_empty() {
            return None;
        }
        let rest = s[colon + 1..].trim_start();
        let mut words = rest.split_whitespace();
        let kind = match words.next()?.to_ascii_lowercase().as_str() {
            "fort" | "fortitude" => SaveKind::Fortitude,
            "reflex" => SaveKind::Reflex,
            "will" => SaveKind::Will,
            _ => return None,
        };
        if !words.next()?.eq_ignore_ascii_case("save") {
            return None;
        }
        // Optional "vs. <effect>" clause runs up to the colon before the
        // starred outcome.
        let star = memchr(b'*', rest.as_bytes())?;
        rest[..star].trim_end().strip_suffix(':')?;
        let (outcome_str, after) = star_group(&rest[star..])?;
        let outcome = outcome_str.trim().to_ascii_lowercase();
        if outcome != "success" && outcome != "failed" {
            return None;
        }
        let after = after.trim_start().strip_prefix(':')?.trim_start();
        if after.as_bytes().first() != Some(&b'(') {
            return None;
        }
        let close = memchr(b')', after.as_bytes())?;
        let inner = &after[1..close];
        let vs = memmem::find(inner.as_bytes(), b"vs.")?;
        let left = inner[..vs].trim();
        let right = inner[vs + 3..].trim_start();
        let plus = memchr(b'+', left.as_bytes())?;
        let _roll: i32 = left[..plus].trim().parse().ok()?;
        let bonus_part = &left[plus + 1..];
        // The "= total" portion is optional in save lines.
        let bonus_str = match memchr(b'=', bonus_part.as_bytes()) {
            Some(eq) => &bonus_part[..eq],
            None => bonus_part,
        };
        let bonus: i32 = bonus_str.trim().parse().ok()?;
        let _dc: i32 = right.strip_prefix("DC:")?.trim().parse().ok()?;

        self.trackers.save_mut(target).record(kind, bonus);
        Some(GameEvent::Save {
            target: target.to_string(),
            kind,
            bonus,
            timestamp,
        })
    }
}

/// Wall-clock time from the bracketed stamp after the chat marker, pinned
/// to today's date. Lines without a readable stamp fall back to now.
fn extract_timestamp(line: &str) -> Option<NaiveDateTime> {
    let chat = memmem::find(line.as_bytes(), CHAT_MARKER.as_bytes())?;
    let rest = &line[chat + CHAT_MARKER.len()..];
    let open = memchr(b'[', rest.as_bytes())?;
    let close = memchr(b']', &rest.as_bytes()[open..])? + open;
    let segment = &rest[open + 1..close];
    let time = segment
        .split_whitespace()
        .find_map(|token| NaiveTime::parse_from_str(token, "%H:%M:%S").ok())?;
    Some(Local::now().date_naive().and_time(time))
}

/// Text after the chat marker and its bracketed timestamp block.
fn strip_chat_prefix(line: &str) -> Option<&str> {
    let chat = memmem::find(line.as_bytes(), CHAT_MARKER.as_bytes())?;
    let rest = line[chat + CHAT_MARKER.len()..].trim_start();
    if rest.as_bytes().first() != Some(&b'[') {
        return None;
    }
    let close = memchr(b']', rest.as_bytes())?;
    Some(rest[close + 1..].trim_start())
}

/// Splits `30 Physical 20 Positive Energy` into typed amounts. An amount
/// opens an entry and every following word up to the next amount names its
/// type; a repeated type keeps the later amount.
fn parse_damage_breakdown(segment: &str) -> Vec<(String, i32)> {
    let mut out: Vec<(String, i32)> = Vec::new();
    let mut amount: Option<i32> = None;
    let mut words: Vec<&str> = Vec::new();
    let mut push = |out: &mut Vec<(String, i32)>, amount: Option<i32>, words: &[&str]| {
        if let Some(amount) = amount
            && !words.is_empty()
        {
            let damage_type = words.join(" ");
            if let Some(entry) = out.iter_mut().find(|(t, _)| *t == damage_type) {
                entry.1 = amount;
            } else {
                out.push((damage_type, amount));
            }
        }
    };
    for token in segment.split_whitespace() {
        if let Ok(value) = token.parse::<i32>() {
            push(&mut out, amount.take(), &words);
            words.clear();
            amount = Some(value);
        } else if amount.is_some() {
            words.push(token);
        }
    }
    push(&mut out, amount, &words);
    out
}

/// Splits off the attacker before ` attacks `. Ability prefixes such as
/// `Off Hand : ` or `Flurry of Blows : ` stack in front, so the attacker is
/// whatever follows the last colon.
fn split_attack_head(line: &str) -> Option<(&str, &str)> {
    let pos = memmem::find(line.as_bytes(), ATTACKS_MARKER.as_bytes())?;
    let head = &line[..pos];
    let attacker = match head.rfind(':') {
        Some(colon) => head[colon + 1..].trim(),
        None => head.trim(),
    };
    if attacker.is_empty() {
        return None;
    }
    Some((attacker, &line[pos + ATTACKS_MARKER.len()..]))
}

/// The target runs up to the colon preceding the first starred group.
fn split_target(rest: &str) -> Option<(&str, &str)> {
    let star = memchr(b'*', rest.as_bytes())?;
    let target = rest[..star].trim_end().strip_suffix(':')?.trim();
    if target.is_empty() {
        return None;
    }
    Some((target, &rest[star..]))
}

/// `s` must begin at a `*`; returns the starred text and what follows it.
fn star_group(s: &str) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'*') {
        return None;
    }
    let close = memchr(b'*', &bytes[1..])? + 1;
    Some((&s[1..close], &s[close + 1..]))
}

fn parse_outcome(s: &str) -> Option<RawOutcome> {
    let lower = s.trim().to_ascii_lowercase();
    match lower.as_str() {
        "hit" => Some(RawOutcome::Hit),
        "critical hit" => Some(RawOutcome::CriticalHit),
        "miss" => Some(RawOutcome::Miss),
        "parried" => Some(RawOutcome::Parried),
        "resisted" => Some(RawOutcome::Resisted),
        _ if lower.starts_with("attacker miss chance") => Some(RawOutcome::MissChance),
        _ => None,
    }
}

/// `: (roll + bonus = total)`, optionally carrying a `: Threat Roll: ...`
/// tail inside the parens on confirmed criticals. The bonus may be
/// negative.
fn parse_roll_triple(s: &str, tolerate_threat_roll: bool) -> Option<((i32, i32, i32), &str)> {
    let s = s.trim_start().strip_prefix(':')?.trim_start();
    if s.as_bytes().first() != Some(&b'(') {
        return None;
    }
    let close = memchr(b')', s.as_bytes())?;
    let mut inner = &s[1..close];
    if tolerate_threat_roll
        && let Some(pos) = memmem::find(inner.as_bytes(), b"Threat Roll")
    {
        inner = inner[..pos].trim_end().trim_end_matches(':').trim_end();
    }
    let plus = memchr(b'+', inner.as_bytes())?;
    let eq = memchr(b'=', inner.as_bytes())?;
    if eq < plus {
        return None;
    }
    let roll: i32 = inner[..plus].trim().parse().ok()?;
    let bonus: i32 = inner[plus + 1..eq].trim().parse().ok()?;
    let total: i32 = inner[eq + 1..].trim().parse().ok()?;
    Some(((roll, bonus, total), &s[close + 1..]))
}

fn attack_with_threat_roll(line: &str) -> Option<AttackLine> {
    let (attacker, rest) = split_attack_head(line)?;
    let (target, rest) = split_target(rest)?;
    let (outcome_str, rest) = star_group(rest)?;
    let outcome = parse_outcome(outcome_str)?;
    let roll = parse_roll_triple(rest, true).map(|(triple, _)| triple);
    Some(AttackLine {
        attacker: attacker.to_string(),
        target: target.to_string(),
        outcome,
        roll,
    })
}

fn attack_with_concealment(line: &str) -> Option<AttackLine> {
    let (attacker, rest) = split_attack_head(line)?;
    let (target, rest) = split_target(rest)?;
    let (conceal_str, rest) = star_group(rest)?;
    if !conceal_str
        .trim()
        .to_ascii_lowercase()
        .starts_with("target concealed")
    {
        return None;
    }
    let (triple, rest) = parse_roll_triple(rest, false)?;
    let rest = rest.trim_start().strip_prefix(':')?.trim_start();
    let (outcome_str, _) = star_group(rest)?;
    let outcome = parse_outcome(outcome_str)?;
    Some(AttackLine {
        attacker: attacker.to_string(),
        target: target.to_string(),
        outcome,
        roll: Some(triple),
    })
}

fn attack_plain(line: &str) -> Option<AttackLine> {
    let (attacker, rest) = split_attack_head(line)?;
    let (target, rest) = split_target(rest)?;
    let (outcome_str, rest) = star_group(rest)?;
    let outcome = parse_outcome(outcome_str)?;
    if outcome == RawOutcome::MissChance {
        return None;
    }
    let roll = parse_roll_triple(rest, false).map(|(triple, _)| triple);
    Some(AttackLine {
        attacker: attacker.to_string(),
        target: target.to_string(),
        outcome,
        roll,
    })
}
