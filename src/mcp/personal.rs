use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{McpToolCall, McpToolDefinition, McpToolResult, ToolClient};

/// An in-process tool provider folded into the personal agent's client.
pub trait PersonalPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn tools(&self) -> Vec<McpToolDefinition>;
    fn execute(&self, call: &McpToolCall) -> McpToolResult;
}

pub struct PersonalToolClient {
    plugins: Vec<Box<dyn PersonalPlugin>>,
}

impl PersonalToolClient {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    pub fn with_default_plugins() -> Self {
        let mut c = Self::new();
        c.register(Box::new(CalendarPlugin::default()));
        c.register(Box::new(FantasyFootballPlugin::default()));
        c
    }

    pub fn register(&mut self, plugin: Box<dyn PersonalPlugin>) {
        self.plugins.push(plugin);
    }

    fn owner(&self, tool_name: &str) -> Option<&dyn PersonalPlugin> {
        self.plugins
            .iter()
            .map(|p| p.as_ref())
            .find(|p| p.tools().iter().any(|t| t.name == tool_name))
    }
}

#[async_trait]
impl ToolClient for PersonalToolClient {
    async fn list_tools(&self) -> anyhow::Result<Vec<McpToolDefinition>> {
        Ok(self.plugins.iter().flat_map(|p| p.tools()).collect())
    }

    async fn execute_tool(&self, call: &McpToolCall) -> anyhow::Result<McpToolResult> {
        Ok(match self.owner(&call.tool_name) {
            Some(plugin) => {
                tracing::debug!(plugin = plugin.name(), tool = %call.tool_name, "dispatching to personal plugin");
                plugin.execute(call)
            }
            None => unknown_tool(call),
        })
    }

    async fn is_healthy(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

fn unknown_tool(call: &McpToolCall) -> McpToolResult {
    McpToolResult::error(call, format!("Unknown tool: {}", call.tool_name))
}

fn parse_args<T: for<'de> Deserialize<'de>>(call: &McpToolCall) -> Result<T, McpToolResult> {
    let raw = if call.arguments.trim().is_empty() { "{}" } else { call.arguments.as_str() };
    serde_json::from_str(raw).map_err(|e| McpToolResult::error(call, format!("invalid arguments for {}: {}", call.tool_name, e)))
}

fn reply(call: &McpToolCall, data: serde_json::Value) -> McpToolResult {
    McpToolResult::ok(call, data.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CalendarEvent {
    id: String,
    title: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateEventArgs {
    title: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventRangeArgs {
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct RemindersArgs {
    count: Option<usize>,
}

const DEFAULT_REMINDERS: usize = 5;

#[derive(Default)]
pub struct CalendarPlugin {
    events: Mutex<Vec<CalendarEvent>>,
}

impl PersonalPlugin for CalendarPlugin {
    fn name(&self) -> &'static str { "calendar" }

    fn tools(&self) -> Vec<McpToolDefinition> {
        vec![
            McpToolDefinition::new(
                "personal_cal_get_events",
                "Gets calendar events for a date range",
                Some(r#"{"type":"object","properties":{"start_date":{"type":"string","format":"date"},"end_date":{"type":"string","format":"date"}},"required":["start_date"]}"#),
            ),
            McpToolDefinition::new(
                "personal_cal_create_event",
                "Creates a new calendar event",
                Some(r#"{"type":"object","properties":{"title":{"type":"string"},"start_time":{"type":"string","format":"date-time"},"end_time":{"type":"string","format":"date-time"},"description":{"type":"string"}},"required":["title","start_time"]}"#),
            ),
            McpToolDefinition::new(
                "personal_cal_get_reminders",
                "Gets upcoming reminders",
                Some(r#"{"type":"object","properties":{"count":{"type":"integer","default":5}}}"#),
            ),
        ]
    }

    fn execute(&self, call: &McpToolCall) -> McpToolResult {
        match call.tool_name.as_str() {
            "personal_cal_create_event" => {
                let args: CreateEventArgs = match parse_args(call) {
                    Ok(a) => a,
                    Err(e) => return e,
                };
                let mut events = self.events.lock();
                let event = CalendarEvent {
                    id: format!("evt-{}", events.len() + 1),
                    title: args.title,
                    start_time: args.start_time,
                    end_time: args.end_time,
                    description: args.description,
                };
                events.push(event.clone());
                reply(call, json!({ "created": true, "event": event }))
            }
            "personal_cal_get_events" => {
                let args: EventRangeArgs = match parse_args(call) {
                    Ok(a) => a,
                    Err(e) => return e,
                };
                let end = args.end_date.unwrap_or(args.start_date);
                let events: Vec<_> = self
                    .events
                    .lock()
                    .iter()
                    .filter(|e| {
                        let day = e.start_time.date_naive();
                        day >= args.start_date && day <= end
                    })
                    .cloned()
                    .collect();
                reply(call, json!({ "events": events }))
            }
            "personal_cal_get_reminders" => {
                let args: RemindersArgs = match parse_args(call) {
                    Ok(a) => a,
                    Err(e) => return e,
                };
                let now = Utc::now();
                let mut upcoming: Vec<_> = self.events.lock().iter().filter(|e| e.start_time >= now).cloned().collect();
                upcoming.sort_by_key(|e| e.start_time);
                let reminders: Vec<_> = upcoming
                    .into_iter()
                    .take(args.count.unwrap_or(DEFAULT_REMINDERS))
                    .map(|e| json!({ "title": e.title, "due_at": e.start_time }))
                    .collect();
                reply(call, json!({ "reminders": reminders }))
            }
            _ => unknown_tool(call),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Player {
    name: &'static str,
    position: &'static str,
    points: f64,
}

#[derive(Debug, Clone)]
struct FantasyTeam {
    id: &'static str,
    name: &'static str,
    wins: u32,
    losses: u32,
    roster: Vec<Player>,
    /// Team total per week, week 1 first.
    weekly_points: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct TeamArgs {
    league_id: String,
    team_id: String,
}

#[derive(Debug, Deserialize)]
struct ScoresArgs {
    league_id: String,
    week: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LeagueArgs {
    league_id: String,
}

fn player(name: &'static str, position: &'static str, points: f64) -> Player {
    Player { name, position, points }
}

/// Read-only fantasy football leagues keyed by league id.
pub struct FantasyFootballPlugin {
    leagues: HashMap<String, Vec<FantasyTeam>>,
}

impl Default for FantasyFootballPlugin {
    fn default() -> Self {
        let demo = vec![
            FantasyTeam {
                id: "t1",
                name: "Gridiron Gurus",
                wins: 8,
                losses: 3,
                roster: vec![
                    player("R. Hale", "QB", 25.3),
                    player("M. Ortiz", "RB", 14.1),
                    player("D. Finch", "WR", 17.8),
                    player("K. Abara", "TE", 9.2),
                ],
                weekly_points: vec![112.4, 120.5, 98.7],
            },
            FantasyTeam {
                id: "t2",
                name: "Blitz Brigade",
                wins: 6,
                losses: 5,
                roster: vec![
                    player("J. Mercer", "QB", 19.4),
                    player("T. Vance", "RB", 22.6),
                    player("L. Osei", "WR", 13.0),
                    player("P. Lund", "TE", 12.7),
                ],
                weekly_points: vec![101.2, 95.3, 118.9],
            },
            FantasyTeam {
                id: "t3",
                name: "End Zone Elite",
                wins: 3,
                losses: 8,
                roster: vec![
                    player("B. Kerr", "QB", 12.1),
                    player("S. Diaz", "RB", 15.9),
                    player("A. Reyes", "WR", 21.4),
                    player("G. Holt", "TE", 11.3),
                ],
                weekly_points: vec![88.0, 104.6, 90.2],
            },
        ];
        Self { leagues: HashMap::from([("demo".to_string(), demo)]) }
    }
}

impl FantasyFootballPlugin {
    fn league(&self, call: &McpToolCall, league_id: &str) -> Result<&[FantasyTeam], McpToolResult> {
        self.leagues
            .get(league_id)
            .map(Vec::as_slice)
            .ok_or_else(|| McpToolResult::error(call, format!("no league with id {}", league_id)))
    }

    fn team<'a>(&'a self, call: &McpToolCall, args: &TeamArgs) -> Result<(&'a [FantasyTeam], &'a FantasyTeam), McpToolResult> {
        let teams = self.league(call, &args.league_id)?;
        let team = teams
            .iter()
            .find(|t| t.id == args.team_id)
            .ok_or_else(|| McpToolResult::error(call, format!("no team {} in league {}", args.team_id, args.league_id)))?;
        Ok((teams, team))
    }

    fn roster(&self, call: &McpToolCall) -> Result<McpToolResult, McpToolResult> {
        let args: TeamArgs = parse_args(call)?;
        let (_, team) = self.team(call, &args)?;
        Ok(reply(call, json!({ "team": team.name, "players": team.roster })))
    }

    fn scores(&self, call: &McpToolCall) -> Result<McpToolResult, McpToolResult> {
        let args: ScoresArgs = parse_args(call)?;
        let teams = self.league(call, &args.league_id)?;
        let played = teams.iter().map(|t| t.weekly_points.len()).min().unwrap_or(0);
        let week = args.week.unwrap_or(played);
        if week == 0 || week > played {
            return Err(McpToolResult::error(call, format!("week {} has not been played, {} weeks so far", week, played)));
        }
        let mut scores: Vec<_> = teams.iter().map(|t| (t.name, t.weekly_points[week - 1])).collect();
        scores.sort_by(|a, b| b.1.total_cmp(&a.1));
        let scores: Vec<_> = scores.into_iter().map(|(team, points)| json!({ "team": team, "points": points })).collect();
        Ok(reply(call, json!({ "week": week, "scores": scores })))
    }

    fn standings(&self, call: &McpToolCall) -> Result<McpToolResult, McpToolResult> {
        let args: LeagueArgs = parse_args(call)?;
        let mut teams: Vec<_> = self.league(call, &args.league_id)?.iter().collect();
        teams.sort_by(|a, b| b.wins.cmp(&a.wins).then(a.losses.cmp(&b.losses)));
        let standings: Vec<_> = teams
            .into_iter()
            .map(|t| json!({ "team": t.name, "wins": t.wins, "losses": t.losses }))
            .collect();
        Ok(reply(call, json!({ "standings": standings })))
    }

    /// For each roster slot, the best same-position player elsewhere in the league
    /// who outscores it. Biggest upgrade first.
    fn suggest_trades(&self, call: &McpToolCall) -> Result<McpToolResult, McpToolResult> {
        let args: TeamArgs = parse_args(call)?;
        let (teams, team) = self.team(call, &args)?;
        let mut trades: Vec<(f64, serde_json::Value)> = team
            .roster
            .iter()
            .filter_map(|mine| {
                let (other, target) = teams
                    .iter()
                    .filter(|t| t.id != team.id)
                    .flat_map(|t| t.roster.iter().map(move |p| (t, p)))
                    .filter(|(_, p)| p.position == mine.position && p.points > mine.points)
                    .max_by(|a, b| a.1.points.total_cmp(&b.1.points))?;
                let gain = target.points - mine.points;
                let trade = json!({
                    "give": mine.name,
                    "receive": target.name,
                    "from_team": other.name,
                    "reason": format!("Upgrade at {} (+{:.1} pts)", mine.position, gain),
                });
                Some((gain, trade))
            })
            .collect();
        trades.sort_by(|a, b| b.0.total_cmp(&a.0));
        let trades: Vec<_> = trades.into_iter().map(|(_, t)| t).collect();
        Ok(reply(call, json!({ "trades": trades })))
    }
}

impl PersonalPlugin for FantasyFootballPlugin {
    fn name(&self) -> &'static str { "fantasy_football" }

    fn tools(&self) -> Vec<McpToolDefinition> {
        vec![
            McpToolDefinition::new(
                "personal_ff_get_roster",
                "Gets the current fantasy football roster",
                Some(r#"{"type":"object","properties":{"league_id":{"type":"string"},"team_id":{"type":"string"}},"required":["league_id","team_id"]}"#),
            ),
            McpToolDefinition::new(
                "personal_ff_get_scores",
                "Gets fantasy football scores for a week, the latest by default",
                Some(r#"{"type":"object","properties":{"league_id":{"type":"string"},"week":{"type":"integer"}},"required":["league_id"]}"#),
            ),
            McpToolDefinition::new(
                "personal_ff_get_standings",
                "Gets fantasy football league standings",
                Some(r#"{"type":"object","properties":{"league_id":{"type":"string"}},"required":["league_id"]}"#),
            ),
            McpToolDefinition::new(
                "personal_ff_suggest_trades",
                "Suggests fantasy football trades based on roster analysis",
                Some(r#"{"type":"object","properties":{"league_id":{"type":"string"},"team_id":{"type":"string"}},"required":["league_id","team_id"]}"#),
            ),
        ]
    }

    fn execute(&self, call: &McpToolCall) -> McpToolResult {
        let outcome = match call.tool_name.as_str() {
            "personal_ff_get_roster" => self.roster(call),
            "personal_ff_get_scores" => self.scores(call),
            "personal_ff_get_standings" => self.standings(call),
            "personal_ff_suggest_trades" => self.suggest_trades(call),
            _ => Err(unknown_tool(call)),
        };
        outcome.unwrap_or_else(|err| err)
    }
}
