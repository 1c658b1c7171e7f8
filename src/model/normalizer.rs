use crate::{
    database::db_structs::{Game, IntegrityViolation, Player, Tournament},
    model::{
        constants::{EXCLUDED_DISCIPLINES, MAX_GAMES_PER_MATCH},
        payload::{MatchPayload, TournamentPayload}
    }
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The payload could not be used at all
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload has no tournament id")]
    MissingTournamentId
}

/// A single match that was rejected. The rest of the tournament is unaffected.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchRejection {
    #[error("malformed match {match_id:?}: {reason}")]
    Malformed { match_id: Option<i64>, reason: String },

    #[error(transparent)]
    Integrity(#[from] IntegrityViolation)
}

impl MatchRejection {
    pub fn match_id(&self) -> Option<i64> {
        match self {
            MatchRejection::Malformed { match_id, .. } => *match_id,
            MatchRejection::Integrity(
                IntegrityViolation::WinnerNotParticipant { match_id, .. }
                | IntegrityViolation::SelfPairing { match_id, .. }
                | IntegrityViolation::ConflictingDuplicate { match_id }
            ) => Some(*match_id)
        }
    }
}

/// Matches that are intentionally left out. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// 0-0, negative or unreadable score
    Degenerate,
    /// A slot has not been drawn yet
    Unplayed,
    /// Doubles or team entry that cannot be rated individually
    TeamEntry,
    /// Exact repeat of a match already seen in the payload
    Duplicate
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedMatch {
    pub match_id: i64,
    pub reason: SkipReason
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTournament {
    pub tournament: Tournament,
    pub players: Vec<Player>,
    pub games: Vec<Game>,
    pub rejected: Vec<MatchRejection>,
    pub skipped: Vec<SkippedMatch>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedTournament {
    pub tournament_id: i64,
    pub name: String,
    pub discipline: String
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Normalized {
    Tournament(NormalizedTournament),
    Excluded(ExcludedTournament)
}

pub fn is_excluded_discipline(discipline: &str) -> bool {
    let lower = discipline.to_lowercase();

    EXCLUDED_DISCIPLINES.iter().any(|excluded| lower.contains(excluded))
}

/// Doubles and team entries are listed under one combined name
pub fn is_team_entry(name: &str) -> bool {
    name.contains('/') || name.contains('&') || name.contains('+') || name.trim().to_lowercase().starts_with("team")
}

const ZONED_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z"
];

const NAIVE_FORMATS: [&str; 4] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"];

/// Tries each supported timestamp format in turn. Values without an offset are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(|secs| DateTime::from_timestamp(secs, 0));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Some(dt) = ZONED_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
    {
        return Some(dt.with_timezone(&Utc));
    }

    if let Some(dt) = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
    {
        return Some(dt.and_utc());
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Turns one raw tournament document into rows ready for the store.
pub fn normalize_payload(bytes: &[u8]) -> Result<Normalized, NormalizeError> {
    let payload: TournamentPayload =
        serde_json::from_slice(bytes).map_err(|e| NormalizeError::InvalidJson(e.to_string()))?;

    normalize(payload)
}

pub fn normalize(payload: TournamentPayload) -> Result<Normalized, NormalizeError> {
    let tournament_id = payload.tournament_id.ok_or(NormalizeError::MissingTournamentId)?;
    let name = payload.name.clone().unwrap_or_default();

    if let Some(discipline) = payload.discipline.as_deref().filter(|d| is_excluded_discipline(d)) {
        info!(tournament_id, discipline, "Skipping tournament {}: not a pool discipline", name);
        return Ok(Normalized::Excluded(ExcludedTournament {
            tournament_id,
            name,
            discipline: discipline.to_owned()
        }));
    }

    let tournament_start = payload.starttime.as_deref().and_then(parse_timestamp);
    let tournament_end = payload.stoptime.as_deref().and_then(parse_timestamp);

    let mut expander = MatchExpander::new(tournament_id, tournament_start);
    for value in payload.matches.iter().flatten() {
        expander.push(value);
    }

    let tournament = Tournament {
        external_id: tournament_id,
        name,
        venue_id: payload.venue_id(),
        start_date: tournament_start.map(|t| t.date_naive()),
        end_date: tournament_end.map(|t| t.date_naive()),
        discipline: payload.discipline
    };

    let normalized = expander.finish(tournament);
    info!(
        tournament_id,
        players = normalized.players.len(),
        games = normalized.games.len(),
        rejected = normalized.rejected.len(),
        skipped = normalized.skipped.len(),
        "Normalized tournament {}",
        normalized.tournament.name
    );

    Ok(Normalized::Tournament(normalized))
}

/// Fully validated content of one match
#[derive(Debug, Clone, PartialEq)]
struct ParsedMatch {
    match_id: i64,
    player_a: (i64, String),
    player_b: (i64, String),
    score_a: i32,
    score_b: i32,
    played_at: DateTime<Utc>
}

struct MatchExpander {
    tournament_id: i64,
    tournament_start: Option<DateTime<Utc>>,
    // Latest sighting wins: (seen at, name)
    players: IndexMap<i64, (DateTime<Utc>, String)>,
    seen: HashMap<i64, ParsedMatch>,
    games: Vec<Game>,
    rejected: Vec<MatchRejection>,
    skipped: Vec<SkippedMatch>
}

impl MatchExpander {
    fn new(tournament_id: i64, tournament_start: Option<DateTime<Utc>>) -> MatchExpander {
        MatchExpander {
            tournament_id,
            tournament_start,
            players: IndexMap::new(),
            seen: HashMap::new(),
            games: Vec::new(),
            rejected: Vec::new(),
            skipped: Vec::new()
        }
    }

    fn push(&mut self, value: &serde_json::Value) {
        match self.parse(value) {
            Ok(Some(parsed)) => self.expand(parsed),
            Ok(None) => {}
            Err(rejection) => {
                warn!(tournament_id = self.tournament_id, "Rejected match: {}", rejection);
                self.rejected.push(rejection);
            }
        }
    }

    fn skip(&mut self, match_id: i64, reason: SkipReason) {
        debug!(tournament_id = self.tournament_id, match_id, ?reason, "Skipping match");
        self.skipped.push(SkippedMatch { match_id, reason });
    }

    fn parse(&mut self, value: &serde_json::Value) -> Result<Option<ParsedMatch>, MatchRejection> {
        let raw: MatchPayload = serde_json::from_value(value.clone()).map_err(|e| MatchRejection::Malformed {
            match_id: value.get("matchId").and_then(|v| v.as_i64()),
            reason: e.to_string()
        })?;

        let match_id = raw.match_id.ok_or_else(|| MatchRejection::Malformed {
            match_id: None,
            reason: "missing match id".to_owned()
        })?;

        let player_a = raw.player_a.as_ref().and_then(|p| p.id().map(|id| (id, p.name.clone().unwrap_or_default())));
        let player_b = raw.player_b.as_ref().and_then(|p| p.id().map(|id| (id, p.name.clone().unwrap_or_default())));
        let (Some(player_a), Some(player_b)) = (player_a, player_b) else {
            self.skip(match_id, SkipReason::Unplayed);
            return Ok(None);
        };

        if is_team_entry(&player_a.1) || is_team_entry(&player_b.1) {
            self.skip(match_id, SkipReason::TeamEntry);
            return Ok(None);
        }

        let (score_a, score_b) = match (raw.score_a, raw.score_b) {
            (Some(a), Some(b)) if a >= 0 && b >= 0 && (a > 0 || b > 0) => (a, b),
            _ => {
                self.skip(match_id, SkipReason::Degenerate);
                return Ok(None);
            }
        };

        match score_a.checked_add(score_b) {
            Some(total) if total <= MAX_GAMES_PER_MATCH => {}
            _ => {
                return Err(MatchRejection::Malformed {
                    match_id: Some(match_id),
                    reason: format!("score {}-{} exceeds {} games", score_a, score_b, MAX_GAMES_PER_MATCH)
                })
            }
        }

        let played_at = match raw.starttime.as_deref().or(raw.stoptime.as_deref()) {
            Some(text) => parse_timestamp(text).ok_or_else(|| MatchRejection::Malformed {
                match_id: Some(match_id),
                reason: format!("unrecognized timestamp '{}'", text)
            })?,
            None => self.tournament_start.ok_or_else(|| MatchRejection::Malformed {
                match_id: Some(match_id),
                reason: "no timestamp on match or tournament".to_owned()
            })?
        };

        Ok(Some(ParsedMatch {
            match_id,
            player_a,
            player_b,
            score_a: score_a as i32,
            score_b: score_b as i32,
            played_at
        }))
    }

    fn expand(&mut self, parsed: ParsedMatch) {
        if let Some(previous) = self.seen.get(&parsed.match_id) {
            if *previous == parsed {
                self.skip(parsed.match_id, SkipReason::Duplicate);
            } else {
                let violation = IntegrityViolation::ConflictingDuplicate {
                    match_id: parsed.match_id
                };
                warn!(tournament_id = self.tournament_id, "Rejected match: {}", violation);
                self.rejected.push(violation.into());
            }
            return;
        }

        let (a, b) = (parsed.player_a.0, parsed.player_b.0);
        let total = parsed.score_a + parsed.score_b;
        let mut games = Vec::with_capacity(total as usize);

        for ordinal in 0..total {
            let winner = if ordinal < parsed.score_a { a } else { b };

            match Game::new(self.tournament_id, parsed.match_id, ordinal, a, b, winner, parsed.played_at) {
                Ok(game) => games.push(game),
                Err(violation) => {
                    warn!(tournament_id = self.tournament_id, "Rejected match: {}", violation);
                    self.rejected.push(violation.into());
                    return;
                }
            }
        }

        for (id, name) in [parsed.player_a.clone(), parsed.player_b.clone()] {
            self.observe_player(id, name, parsed.played_at);
        }

        self.games.extend(games);
        self.seen.insert(parsed.match_id, parsed);
    }

    fn observe_player(&mut self, id: i64, name: String, seen_at: DateTime<Utc>) {
        match self.players.get_mut(&id) {
            Some(entry) if entry.0 <= seen_at => *entry = (seen_at, name),
            Some(_) => {}
            None => {
                self.players.insert(id, (seen_at, name));
            }
        }
    }

    fn finish(self, tournament: Tournament) -> NormalizedTournament {
        let players = self
            .players
            .into_iter()
            .map(|(external_id, (_, name))| Player { external_id, name })
            .collect();

        NormalizedTournament {
            tournament,
            players,
            games: self.games,
            rejected: self.rejected,
            skipped: self.skipped
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        database::db_structs::IntegrityViolation,
        model::normalizer::{
            is_excluded_discipline, is_team_entry, normalize_payload, parse_timestamp, MatchRejection, Normalized,
            NormalizedTournament, SkipReason
        },
        utils::test_utils::{match_json, tournament_json}
    };
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;

    fn normalized(payload: serde_json::Value) -> NormalizedTournament {
        match normalize_payload(payload.to_string().as_bytes()).unwrap() {
            Normalized::Tournament(t) => t,
            Normalized::Excluded(e) => panic!("unexpected exclusion of {}", e.tournament_id)
        }
    }

    #[test]
    fn test_match_expands_into_games() {
        let payload = tournament_json(
            1,
            "9-ball",
            vec![match_json(10, (100, "Anna"), (200, "Bartek"), 7, 5, "2024-03-15 19:00:00")]
        );

        let t = normalized(payload);

        assert_eq!(t.games.len(), 12);
        assert_eq!(t.games.iter().filter(|g| g.winner == 100).count(), 7);
        assert_eq!(t.games.iter().filter(|g| g.winner == 200).count(), 5);
        assert!(t.games.iter().all(|g| g.source_match_id == 10 && g.tournament_id == 1));
        assert!(t
            .games
            .iter()
            .all(|g| g.played_at == Utc.with_ymd_and_hms(2024, 3, 15, 19, 0, 0).unwrap()));
        assert_eq!(t.games.iter().map(|g| g.ordinal).collect::<Vec<_>>(), (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_expansion_counts_for_many_scores() {
        for score_a in 0..6 {
            for score_b in 0..6 {
                let payload = tournament_json(
                    1,
                    "8-ball",
                    vec![match_json(10, (100, "A"), (200, "B"), score_a, score_b, "2024-03-15")]
                );

                let t = normalized(payload);

                assert_eq!(t.games.len() as i64, score_a + score_b);
                assert_eq!(t.games.iter().filter(|g| g.winner == 100).count() as i64, score_a);
            }
        }
    }

    #[test]
    fn test_zero_zero_is_skipped_not_rejected() {
        let payload = tournament_json(1, "9-ball", vec![match_json(10, (100, "A"), (200, "B"), 0, 0, "2024-03-15")]);

        let t = normalized(payload);

        assert!(t.games.is_empty());
        assert!(t.rejected.is_empty());
        assert_eq!(t.skipped[0].reason, SkipReason::Degenerate);
    }

    #[test]
    fn test_oversized_scores_reject_only_that_match() {
        let payload = tournament_json(
            1,
            "9-ball",
            vec![
                match_json(10, (100, "A"), (200, "B"), i64::MAX, 1, "2024-03-15"),
                match_json(11, (100, "A"), (200, "B"), 4_000_000_000, 0, "2024-03-15"),
                match_json(12, (100, "A"), (200, "B"), 10_001, 0, "2024-03-15"),
                match_json(13, (100, "A"), (300, "C"), 3, 2, "2024-03-15"),
            ]
        );

        let t = normalized(payload);

        assert_eq!(t.games.len(), 5);
        assert_eq!(t.rejected.iter().map(|r| r.match_id()).collect::<Vec<_>>(), vec![Some(10), Some(11), Some(12)]);
        assert!(t.rejected.iter().all(|r| matches!(r, MatchRejection::Malformed { .. })));
    }

    #[test]
    fn test_long_race_is_expanded() {
        let payload = tournament_json(1, "9-ball", vec![match_json(10, (100, "A"), (200, "B"), 101, 99, "2024-03-15")]);

        let t = normalized(payload);

        assert_eq!(t.games.len(), 200);
        assert_eq!(t.games.last().map(|g| g.ordinal), Some(199));
    }

    #[test]
    fn test_excluded_disciplines() {
        assert!(is_excluded_discipline("Snooker"));
        assert!(is_excluded_discipline("Russian Pyramid - free"));
        assert!(is_excluded_discipline("PIRAMIDA"));
        assert!(!is_excluded_discipline("9-ball"));

        let payload = tournament_json(5, "Snooker", vec![match_json(10, (1, "A"), (2, "B"), 3, 1, "2024-03-15")]);

        match normalize_payload(payload.to_string().as_bytes()).unwrap() {
            Normalized::Excluded(e) => assert_eq!(e.tournament_id, 5),
            Normalized::Tournament(_) => panic!("snooker should be excluded")
        }
    }

    #[test]
    fn test_bad_timestamp_rejects_only_that_match() {
        let payload = tournament_json(
            1,
            "9-ball",
            vec![
                match_json(10, (100, "A"), (200, "B"), 3, 1, "yesterday evening"),
                match_json(11, (100, "A"), (300, "C"), 2, 3, "2024-03-15T20:00:00Z"),
            ]
        );

        let t = normalized(payload);

        assert_eq!(t.games.len(), 5);
        assert_eq!(t.rejected.len(), 1);
        assert_eq!(t.rejected[0].match_id(), Some(10));
        assert!(matches!(t.rejected[0], MatchRejection::Malformed { .. }));
    }

    #[test]
    fn test_timestamp_falls_back_to_tournament_start() {
        let mut payload = tournament_json(1, "9-ball", vec![json!({
            "matchId": 10,
            "playerA": {"playerId": 100, "name": "A"},
            "playerB": {"playerId": 200, "name": "B"},
            "scoreA": 2,
            "scoreB": 1
        })]);
        payload["starttime"] = json!("2024-02-01 18:00:00");

        let t = normalized(payload);

        assert_eq!(t.games.len(), 3);
        assert_eq!(t.games[0].played_at, Utc.with_ymd_and_hms(2024, 2, 1, 18, 0, 0).unwrap());
        assert_eq!(t.tournament.start_date, NaiveDate::from_ymd_opt(2024, 2, 1));
    }

    #[test]
    fn test_self_pairing_is_an_integrity_rejection() {
        let payload = tournament_json(1, "9-ball", vec![match_json(10, (100, "A"), (100, "A"), 3, 1, "2024-03-15")]);

        let t = normalized(payload);

        assert!(t.games.is_empty());
        assert_eq!(
            t.rejected,
            vec![MatchRejection::Integrity(IntegrityViolation::SelfPairing {
                match_id: 10,
                player_id: 100
            })]
        );
    }

    #[test]
    fn test_duplicate_match_ids() {
        let payload = tournament_json(
            1,
            "9-ball",
            vec![
                match_json(10, (100, "A"), (200, "B"), 3, 1, "2024-03-15"),
                match_json(10, (100, "A"), (200, "B"), 3, 1, "2024-03-15"),
                match_json(10, (100, "A"), (200, "B"), 1, 3, "2024-03-15"),
            ]
        );

        let t = normalized(payload);

        assert_eq!(t.games.len(), 4);
        assert_eq!(t.skipped[0].reason, SkipReason::Duplicate);
        assert_eq!(
            t.rejected,
            vec![MatchRejection::Integrity(IntegrityViolation::ConflictingDuplicate { match_id: 10 })]
        );
    }

    #[test]
    fn test_unplayed_and_team_matches_are_skipped() {
        let payload = tournament_json(
            1,
            "9-ball",
            vec![
                match_json(10, (100, "A"), (0, ""), 0, 0, "2024-03-15"),
                match_json(11, (100, "Kowalski / Nowak"), (200, "B"), 5, 2, "2024-03-15"),
                match_json(12, (100, "A"), (300, "Team Wola"), 5, 2, "2024-03-15"),
            ]
        );

        let t = normalized(payload);

        assert!(t.games.is_empty());
        assert_eq!(
            t.skipped.iter().map(|s| s.reason).collect::<Vec<_>>(),
            vec![SkipReason::Unplayed, SkipReason::TeamEntry, SkipReason::TeamEntry]
        );
        assert!(is_team_entry("A & B"));
        assert!(!is_team_entry("Anna Kowalska"));
    }

    #[test]
    fn test_latest_name_wins() {
        let payload = tournament_json(
            1,
            "9-ball",
            vec![
                match_json(11, (100, "Jan K."), (200, "B"), 2, 1, "2024-03-15 21:00:00"),
                match_json(10, (100, "Jan"), (300, "C"), 2, 1, "2024-03-15 19:00:00"),
            ]
        );

        let t = normalized(payload);
        let jan = t.players.iter().find(|p| p.external_id == 100).unwrap();

        assert_eq!(t.players.len(), 3);
        assert_eq!(jan.name, "Jan K.");
    }

    #[test]
    fn test_invalid_json_and_missing_id() {
        assert!(normalize_payload(b"<html>").is_err());
        assert!(normalize_payload(br#"{"name": "no id"}"#).is_err());
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 15, 19, 30, 0).unwrap();

        assert_eq!(parse_timestamp("2024-03-15 19:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-15T19:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-15T19:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-15T20:30:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-15 20:30:00+0100"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-15T19:30:00.000Z"), Some(expected));
        assert_eq!(parse_timestamp("1710531000"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-03-15"),
            Some(Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("15/03/2024"), None);
        assert_eq!(parse_timestamp("   "), None);
    }
}
