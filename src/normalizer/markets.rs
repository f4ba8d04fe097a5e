//! Provider market codes and selection text.

use crate::db::models::Direction;

const PLAYER_PREFIXES: &[&str] = &["player_", "batter_", "pitcher_"];
const ALTERNATE_SUFFIX: &str = "_alternate";

/// Market code → canonical stat name. Codes outside the player prefixes are
/// provider shorthands that are still player propositions.
const STAT_TABLE: &[(&str, &str)] = &[
    // Basketball
    ("player_points", "Points"),
    ("player_rebounds", "Rebounds"),
    ("player_assists", "Assists"),
    ("player_threes", "3-Pointers Made"),
    ("player_steals", "Steals"),
    ("player_blocks", "Blocks"),
    ("player_turnovers", "Turnovers"),
    ("player_blocks_steals", "Blks+Stls"),
    ("player_points_rebounds_assists", "Pts+Rebs+Asts"),
    ("player_points_rebounds", "Pts+Rebs"),
    ("player_points_assists", "Pts+Asts"),
    ("player_rebounds_assists", "Rebs+Asts"),
    ("pts", "Points"),
    ("reb", "Rebounds"),
    ("ast", "Assists"),
    ("pra", "Pts+Rebs+Asts"),
    // Football
    ("player_pass_yds", "Passing Yards"),
    ("player_pass_tds", "Passing TDs"),
    ("player_pass_completions", "Completions"),
    ("player_pass_attempts", "Pass Attempts"),
    ("player_pass_interceptions", "Interceptions"),
    ("player_rush_yds", "Rushing Yards"),
    ("player_rush_attempts", "Rush Attempts"),
    ("player_receptions", "Receptions"),
    ("player_reception_yds", "Receiving Yards"),
    ("player_kicking_points", "Kicking Points"),
    // Baseball
    ("batter_hits", "Hits"),
    ("batter_total_bases", "Total Bases"),
    ("batter_home_runs", "Home Runs"),
    ("batter_rbis", "RBIs"),
    ("batter_runs_scored", "Runs"),
    ("batter_walks", "Walks"),
    ("batter_strikeouts", "Batter Strikeouts"),
    ("pitcher_strikeouts", "Strikeouts"),
    ("pitcher_hits_allowed", "Hits Allowed"),
    ("pitcher_walks", "Walks Allowed"),
    ("pitcher_earned_runs", "Earned Runs"),
    ("pitcher_outs", "Pitching Outs"),
    // Hockey / soccer
    ("player_goals", "Goals"),
    ("player_shots_on_goal", "Shots on Goal"),
    ("player_power_play_points", "Power Play Points"),
    ("player_total_saves", "Saves"),
    ("player_shots", "Shots"),
    ("sog", "Shots on Goal"),
];

fn base_code(market: &str) -> String {
    let code = market.trim().to_lowercase();
    match code.strip_suffix(ALTERNATE_SUFFIX) {
        Some(base) => base.to_string(),
        None => code,
    }
}

fn table_lookup(code: &str) -> Option<&'static str> {
    STAT_TABLE.iter().find(|(c, _)| *c == code).map(|(_, s)| *s)
}

pub fn is_player_prop(market: &str) -> bool {
    let code = base_code(market);
    PLAYER_PREFIXES.iter().any(|p| code.starts_with(p) && code.len() > p.len()) || table_lookup(&code).is_some()
}

/// Alternate-lines markets list several lines for one player and stat.
pub fn is_alternate(market: &str) -> bool {
    market.trim().to_lowercase().ends_with(ALTERNATE_SUFFIX)
}

/// Canonical stat name: table entry, else the code with prefixes and the
/// alternate suffix removed, title-cased.
pub fn canonical_stat(market: &str) -> String {
    let code = base_code(market);
    if let Some(stat) = table_lookup(&code) {
        return stat.to_string();
    }
    let rest = PLAYER_PREFIXES
        .iter()
        .find_map(|p| code.strip_prefix(p))
        .unwrap_or(&code);
    rest.split('_')
        .filter(|w| !w.is_empty())
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Whole-word `over`/`under` occurrences with their byte offsets.
fn side_words(text: &str) -> Vec<(usize, Direction)> {
    let mut found = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
        if c.is_alphanumeric() {
            start.get_or_insert(i);
        } else if let Some(s) = start.take() {
            let word = &text[s..i];
            if word.eq_ignore_ascii_case("over") {
                found.push((s, Direction::Over));
            } else if word.eq_ignore_ascii_case("under") {
                found.push((s, Direction::Under));
            }
        }
    }
    found
}

/// Side of a selection. `None` when the text names neither side, or both.
pub fn parse_direction(selection: &str) -> Option<Direction> {
    let words = side_words(selection);
    let first = words.first()?.1;
    if words.iter().all(|(_, d)| *d == first) {
        Some(first)
    } else {
        None
    }
}

/// Player name from a selection like `J. Doe Over 24.5`. `None` when the
/// selection carries only the side.
pub fn strip_player_name(selection: &str) -> Option<String> {
    let cut = side_words(selection).last().map(|(pos, _)| *pos).unwrap_or(selection.len());
    let name = selection[..cut]
        .trim()
        .trim_end_matches(|c: char| c == '-' || c == ',' || c == '(' || c == ':')
        .trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_prop_codes() {
        assert!(is_player_prop("player_points"));
        assert!(is_player_prop("PLAYER_POINTS_ALTERNATE"));
        assert!(is_player_prop("batter_doubles"));
        assert!(is_player_prop("pra"));
        assert!(!is_player_prop("h2h"));
        assert!(!is_player_prop("totals"));
        assert!(!is_player_prop("player_"));
    }

    #[test]
    fn test_canonical_stat() {
        assert_eq!(canonical_stat("player_points"), "Points");
        assert_eq!(canonical_stat("player_points_alternate"), "Points");
        assert_eq!(canonical_stat("player_double_double"), "Double Double");
        assert_eq!(canonical_stat("batter_stolen_bases_alternate"), "Stolen Bases");
        assert_eq!(canonical_stat("pitcher_outs"), "Pitching Outs");
    }

    #[test]
    fn test_alternate_markets() {
        assert!(is_alternate("player_points_alternate"));
        assert!(is_alternate(" PLAYER_POINTS_ALTERNATE"));
        assert!(!is_alternate("player_points"));
    }

    #[test]
    fn test_direction_whole_words_only() {
        assert_eq!(parse_direction("J. Doe Over 24.5"), Some(Direction::Over));
        assert_eq!(parse_direction("j. doe UNDER 24.5"), Some(Direction::Under));
        assert_eq!(parse_direction("Under"), Some(Direction::Under));
        // "Overton" is a name, not a side
        assert_eq!(parse_direction("Jo Overton 24.5"), None);
        assert_eq!(parse_direction("J. Doe 24.5"), None);
        assert_eq!(parse_direction("Over/Under 24.5"), None);
    }

    #[test]
    fn test_strip_player_name() {
        assert_eq!(strip_player_name("J. Doe Over 24.5").as_deref(), Some("J. Doe"));
        assert_eq!(strip_player_name("Shai Gilgeous-Alexander - Under 31.5").as_deref(), Some("Shai Gilgeous-Alexander"));
        assert_eq!(strip_player_name("Over 24.5"), None);
        assert_eq!(strip_player_name("Over"), None);
    }
}
