use chrono::Timelike;

use super::*;
use crate::estimators::DefenseEstimate;

const PREFIX: &str = "[CHAT WINDOW TEXT] [Wed Dec 31 21:07:37]";

fn test_parser() -> LogParser {
    LogParser::new(None, true)
}

#[test]
fn parses_damage_line() {
    let mut parser = test_parser();
    let line = format!("{PREFIX} Woo damages Goblin: 50 (30 Physical 20 Fire)");
    let Some(GameEvent::Damage {
        attacker,
        target,
        total,
        breakdown,
        timestamp,
        filtered_for_player,
    }) = parser.parse_line(&line)
    else {
        panic!("expected damage event");
    };
    assert_eq!(attacker, "Woo");
    assert_eq!(target, "Goblin");
    assert_eq!(total, 50);
    assert_eq!(
        breakdown,
        vec![("Physical".to_string(), 30), ("Fire".to_string(), 20)]
    );
    assert_eq!(timestamp.hour(), 21);
    assert_eq!(timestamp.minute(), 7);
    assert_eq!(timestamp.second(), 37);
    assert!(!filtered_for_player);
}

#[test]
fn damage_breakdown_handles_multiword_types() {
    let mut parser = test_parser();
    let line = format!("{PREFIX} Woo damages Lich: 35 (21 Physical 13 Positive Energy 1 Pure)");
    let Some(GameEvent::Damage { breakdown, .. }) = parser.parse_line(&line) else {
        panic!("expected damage event");
    };
    assert_eq!(
        breakdown,
        vec![
            ("Physical".to_string(), 21),
            ("Positive Energy".to_string(), 13),
            ("Pure".to_string(), 1),
        ]
    );
}

#[test]
fn damage_requires_chat_prefix() {
    let mut parser = test_parser();
    assert!(
        parser
            .parse_line("Woo damages Goblin: 50 (50 Physical)")
            .is_none()
    );
}

#[test]
fn damage_updates_context_for_immunity_resync() {
    let mut parser = test_parser();
    let line = format!("{PREFIX} Woo damages Goblin: 50 (30 Physical 20 Fire)");
    parser.parse_line(&line).unwrap();
    assert_eq!(parser.current_target.as_deref(), Some("Goblin"));
    assert_eq!(parser.current_processing_type.as_deref(), Some("Physical"));

    let line = format!("{PREFIX} Goblin : Damage Immunity absorbs 10 points of Fire");
    parser.parse_line(&line).unwrap();
    assert_eq!(parser.current_processing_type.as_deref(), Some("Fire"));
}

#[test]
fn parses_immunity_point_variants() {
    let mut parser = test_parser();
    for tail in ["10 points of Fire", "1 point of Fire", "3 point(s) of Fire"] {
        let line = format!("{PREFIX} Goblin : Damage Immunity absorbs {tail}");
        let Some(GameEvent::Immunity {
            target,
            damage_type,
            ..
        }) = parser.parse_line(&line)
        else {
            panic!("expected immunity event for {tail:?}");
        };
        assert_eq!(target, "Goblin");
        assert_eq!(damage_type, "Fire");
    }
}

#[test]
fn immunity_disabled_by_flag() {
    let mut parser = LogParser::new(None, false);
    let line = format!("{PREFIX} Goblin : Damage Immunity absorbs 10 points of Fire");
    assert!(parser.parse_line(&line).is_none());
}

#[test]
fn parses_plain_attack_hit() {
    let mut parser = test_parser();
    let line = format!("{PREFIX} Woo attacks Goblin : *hit* : (15 + 6 = 21)");
    let Some(GameEvent::Attack {
        attacker,
        target,
        outcome,
        roll,
        bonus,
        total,
        was_nat1,
        ..
    }) = parser.parse_line(&line)
    else {
        panic!("expected attack event");
    };
    assert_eq!(attacker, "Woo");
    assert_eq!(target, "Goblin");
    assert_eq!(outcome, AttackOutcome::Hit);
    assert_eq!((roll, bonus, total), (15, 6, 21));
    assert!(!was_nat1);
}

#[test]
fn parses_attack_without_chat_prefix() {
    let mut parser = test_parser();
    let event = parser.parse_line("Goblin attacks Woo : *miss* : (3 + 4 = 7)");
    let Some(GameEvent::Attack { outcome, total, .. }) = event else {
        panic!("expected attack event");
    };
    assert_eq!(outcome, AttackOutcome::Miss);
    assert_eq!(total, 7);
}

#[test]
fn parses_critical_hit_with_threat_roll() {
    let mut parser = test_parser();
    let line =
        format!("{PREFIX} Woo attacks Goblin : *critical hit* : (18 + 10 = 28 : Threat Roll: 15 + 10 = 25)");
    let Some(GameEvent::Attack { outcome, total, .. }) = parser.parse_line(&line) else {
        panic!("expected attack event");
    };
    assert_eq!(outcome, AttackOutcome::CriticalHit);
    assert_eq!(total, 28);
}

#[test]
fn parried_and_resisted_count_as_misses() {
    let mut parser = test_parser();
    for outcome in ["parried", "resisted"] {
        let line = format!("{PREFIX} Woo attacks Skeleton : *{outcome}* : (9 + 6 = 15)");
        let Some(GameEvent::Attack { outcome, .. }) = parser.parse_line(&line) else {
            panic!("expected attack event");
        };
        assert_eq!(outcome, AttackOutcome::Miss);
    }
    assert_eq!(
        parser.trackers.defense("Skeleton").unwrap().max_miss(),
        Some(15)
    );
}

#[test]
fn attacker_resolves_past_ability_prefixes() {
    let mut parser = test_parser();
    let line = format!("{PREFIX} Off Hand : Flurry of Blows : Woo attacks Goblin : *hit* : (12 + 6 = 18)");
    let Some(GameEvent::Attack { attacker, .. }) = parser.parse_line(&line) else {
        panic!("expected attack event");
    };
    assert_eq!(attacker, "Woo");
    assert_eq!(parser.trackers.attack_bonus("Woo").unwrap().estimate(), Some(6));
}

#[test]
fn concealment_form_plain_miss_still_bounds_defense() {
    let mut parser = test_parser();
    let line = format!("{PREFIX} Woo attacks Goblin : *target concealed: 50%* : (15 + 6 = 21) : *miss*");
    let Some(GameEvent::Attack { outcome, roll, .. }) = parser.parse_line(&line) else {
        panic!("expected attack event");
    };
    assert_eq!(outcome, AttackOutcome::Miss);
    assert_eq!(roll, 15);
    // The attack lost to armor class, not to the concealment roll.
    assert_eq!(parser.trackers.defense("Goblin").unwrap().max_miss(), Some(21));
    assert_eq!(parser.trackers.attack_bonus("Woo").unwrap().estimate(), Some(6));
}

#[test]
fn miss_chance_outcome_never_touches_defense() {
    let mut parser = test_parser();
    let line = format!("{PREFIX} Goblin attacks Woo : *attacker miss chance: 20%* : (10 + 5 = 15)");
    let Some(GameEvent::Attack { outcome, .. }) = parser.parse_line(&line) else {
        panic!("expected attack event");
    };
    assert_eq!(outcome, AttackOutcome::Miss);
    assert_eq!(
        parser.trackers.defense("Woo").unwrap().estimate(),
        DefenseEstimate::Unknown
    );
}

#[test]
fn negative_bonus_parses() {
    let mut parser = test_parser();
    let line = format!("{PREFIX} Mook attacks Woo : *miss* : (12 + -2 = 10)");
    let Some(GameEvent::Attack { bonus, total, .. }) = parser.parse_line(&line) else {
        panic!("expected attack event");
    };
    assert_eq!(bonus, -2);
    assert_eq!(total, 10);
}

#[test]
fn attack_without_roll_produces_no_event() {
    let mut parser = test_parser();
    let line = format!("{PREFIX} Woo attacks Goblin : *miss*");
    assert!(parser.parse_line(&line).is_none());
    assert!(parser.trackers.defense("Goblin").is_none());
}

#[test]
fn natural_rolls_excluded_from_defense() {
    let mut parser = test_parser();
    let hit = format!("{PREFIX} Woo attacks Goblin : *hit* : (20 + 6 = 26)");
    let miss = format!("{PREFIX} Woo attacks Goblin : *miss* : (1 + 6 = 7)");
    parser.parse_line(&hit).unwrap();
    parser.parse_line(&miss).unwrap();
    assert_eq!(
        parser.trackers.defense("Goblin").unwrap().estimate(),
        DefenseEstimate::Unknown
    );
}

#[test]
fn defense_sequence_pins_exact_value() {
    let mut parser = test_parser();
    for line in [
        "Woo attacks Goblin : *hit* : (15 + 6 = 21)",
        "Woo attacks Goblin : *miss* : (9 + 6 = 15)",
        "Woo attacks Goblin : *hit* : (10 + 6 = 16)",
    ] {
        let line = format!("{PREFIX} {line}");
        parser.parse_line(&line).unwrap();
    }
    assert_eq!(
        parser.trackers.defense("Goblin").unwrap().estimate().to_string(),
        "16"
    );
}

#[test]
fn parses_save_line() {
    let mut parser = test_parser();
    let line = format!("{PREFIX} Goblin : Fortitude Save : *success* : (10 + 8 = 18 vs. DC: 15)");
    let Some(GameEvent::Save {
        target,
        kind,
        bonus,
        ..
    }) = parser.parse_line(&line)
    else {
        panic!("expected save event");
    };
    assert_eq!(target, "Goblin");
    assert_eq!(kind, SaveKind::Fortitude);
    assert_eq!(bonus, 8);
}

#[test]
fn save_accepts_prefix_vs_clause_and_missing_total() {
    let mut parser = test_parser();
    let line = format!("{PREFIX} SAVE: Goblin : Reflex Save vs. Spell : *failed* : (4 + 2 vs. DC: 20)");
    let Some(GameEvent::Save { kind, bonus, .. }) = parser.parse_line(&line) else {
        panic!("expected save event");
    };
    assert_eq!(kind, SaveKind::Reflex);
    assert_eq!(bonus, 2);
}

#[test]
fn save_fort_abbreviation_and_max_kept() {
    let mut parser = test_parser();
    let high = format!("{PREFIX} Goblin : Fort Save : *success* : (12 + 8 = 20 vs. DC: 15)");
    let low = format!("{PREFIX} Goblin : Fort Save : *failed* : (3 + 5 = 8 vs. DC: 15)");
    parser.parse_line(&high).unwrap();
    parser.parse_line(&low).unwrap();
    assert_eq!(
        parser.trackers.saves("Goblin").unwrap().get(SaveKind::Fortitude),
        Some(8)
    );
}

#[test]
fn player_filter_flags_other_attackers() {
    let mut parser = LogParser::new(Some("Woo".to_string()), true);
    let own = format!("{PREFIX} Woo damages Goblin: 10 (10 Physical)");
    let other = format!("{PREFIX} Mook damages Goblin: 10 (10 Physical)");
    let Some(GameEvent::Damage {
        filtered_for_player, ..
    }) = parser.parse_line(&own)
    else {
        panic!("expected damage event");
    };
    assert!(!filtered_for_player);
    let Some(GameEvent::Damage {
        filtered_for_player, ..
    }) = parser.parse_line(&other)
    else {
        panic!("expected damage event");
    };
    assert!(filtered_for_player);
}

#[test]
fn garbled_timestamp_falls_back_to_now() {
    let mut parser = test_parser();
    let line = "[CHAT WINDOW TEXT] [garbage] Woo damages Goblin: 10 (10 Physical)";
    assert!(matches!(
        parser.parse_line(line),
        Some(GameEvent::Damage { .. })
    ));
}

#[test]
fn multibyte_names_never_split_mid_character() {
    let mut parser = test_parser();
    // Byte 5 of this line falls inside a two-byte character.
    assert!(parser.parse_line("Annaïs waves to everyone.").is_none());

    let line = format!("{PREFIX} Annaïs : Will Save : *success* : (11 + 7 = 18 vs. DC: 14)");
    let Some(GameEvent::Save { target, kind, .. }) = parser.parse_line(&line) else {
        panic!("expected save event");
    };
    assert_eq!(target, "Annaïs");
    assert_eq!(kind, SaveKind::Will);
}

#[test]
fn chatter_classifies_to_nothing() {
    let mut parser = test_parser();
    for line in [
        "Goblin attempts to hide.",
        &format!("{PREFIX} Woo: hello everyone"),
        &format!("{PREFIX} Woo damages Goblin: not-a-number (10 Physical)"),
        "",
        "   ",
    ] {
        assert!(parser.parse_line(line).is_none(), "line {line:?}");
    }
}
