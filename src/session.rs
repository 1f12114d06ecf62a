use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::database::{Database, DatabaseSource, LoadedDatabase};
use crate::generator::{GenerationOptions, Generated, generate_puzzle};
use crate::puzzle::{GROUP_SIZE, Group, Puzzle};
use crate::render::{Renderer, Severity};

pub const MAX_MISTAKES: u8 = 4;
pub const MAX_SELECTION: usize = GROUP_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No database yet.
    Idle,
    /// Database loaded, no puzzle dealt.
    Ready,
    Playing,
    Won,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("a database load is in progress")]
    Busy,
    #[error("no database has been loaded")]
    NoDatabase,
    #[error("no game is in progress")]
    NotPlaying,
    #[error("exactly {MAX_SELECTION} expressions must be selected, found {0}")]
    IncompleteSelection(usize),
    #[error("expression is not on the board: {0}")]
    UnknownExpression(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    Selected,
    Deselected,
    /// A fifth selection while four are already selected.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Correct { category: String, won: bool },
    OneAway { remaining: u8 },
    Incorrect { remaining: u8 },
    Lost { revealed: Vec<String> },
}

/// All mutable game state for one player: the database, the dealt puzzle and
/// the progress through it.
///
/// Every mutating call is rejected with [`SessionError::Busy`] while a database
/// switch is pending.
pub struct GameSession<R = SmallRng> {
    rng: R,
    database: Option<LoadedDatabase>,
    puzzle: Option<Puzzle>,
    grid: Vec<String>,
    selected: Vec<String>,
    found: Vec<Group>,
    mistakes_remaining: u8,
    phase: Phase,
    busy: bool,
}

impl GameSession<SmallRng> {
    pub fn seeded(seed: u64) -> Self {
        Self::new(SmallRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self::new(SmallRng::from_entropy())
    }
}

impl<R: Rng> GameSession<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            database: None,
            puzzle: None,
            grid: Vec::new(),
            selected: Vec::new(),
            found: Vec::new(),
            mistakes_remaining: MAX_MISTAKES,
            phase: Phase::Idle,
            busy: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref().map(|loaded| &loaded.database)
    }

    pub fn database_id(&self) -> Option<&str> {
        self.database.as_ref().map(|loaded| loaded.id.as_str())
    }

    pub fn puzzle(&self) -> Option<&Puzzle> {
        self.puzzle.as_ref()
    }

    /// Expressions still on the board, in display order.
    pub fn grid(&self) -> &[String] {
        &self.grid
    }

    pub fn selected(&self) -> &[String] {
        &self.selected
    }

    pub fn found_groups(&self) -> &[Group] {
        &self.found
    }

    pub fn mistakes_remaining(&self) -> u8 {
        self.mistakes_remaining
    }

    pub fn can_submit(&self) -> bool {
        !self.busy && self.phase == Phase::Playing && self.selected.len() == MAX_SELECTION
    }

    pub fn unfound_groups(&self) -> Vec<&Group> {
        self.puzzle
            .iter()
            .flat_map(|puzzle| puzzle.groups.iter())
            .filter(|group| !self.is_found(group))
            .collect()
    }

    fn is_found(&self, group: &Group) -> bool {
        self.found.iter().any(|found| found.category == group.category)
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.busy {
            Err(SessionError::Busy)
        } else {
            Ok(())
        }
    }

    fn ensure_playing(&self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        if self.phase == Phase::Playing {
            Ok(())
        } else {
            Err(SessionError::NotPlaying)
        }
    }

    /// Marks a database switch as pending. A second switch is refused until
    /// [`finish_load`](Self::finish_load) runs.
    pub fn begin_load(&mut self, renderer: &mut dyn Renderer) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.busy = true;
        renderer.render_loading(true);
        Ok(())
    }

    /// Installs a freshly loaded (or fallback) database and clears the board.
    pub fn finish_load(&mut self, loaded: LoadedDatabase, renderer: &mut dyn Renderer) {
        info!(
            database = %loaded.id,
            expressions = loaded.database.len(),
            fallback = loaded.fell_back,
            "database installed"
        );
        self.database = Some(loaded);
        self.puzzle = None;
        self.grid.clear();
        self.selected.clear();
        self.found.clear();
        self.mistakes_remaining = MAX_MISTAKES;
        self.phase = Phase::Ready;
        self.busy = false;
        renderer.render_loading(false);
    }

    /// Loads `id` from `source` and deals a new puzzle from it.
    pub fn switch_database(
        &mut self,
        source: &DatabaseSource,
        id: &str,
        options: &GenerationOptions,
        renderer: &mut dyn Renderer,
    ) -> Result<Generated, SessionError> {
        self.begin_load(renderer)?;
        let loaded = source.load_or_fallback(id);
        self.finish_load(loaded, renderer);
        self.new_game(options, renderer)
    }

    pub fn new_game(
        &mut self,
        options: &GenerationOptions,
        renderer: &mut dyn Renderer,
    ) -> Result<Generated, SessionError> {
        self.ensure_idle()?;
        let database = self
            .database
            .as_ref()
            .map(|loaded| &loaded.database)
            .ok_or(SessionError::NoDatabase)?;
        let generated = generate_puzzle(database, options, &mut self.rng);

        let mut grid: Vec<String> = generated.puzzle.expressions().map(str::to_string).collect();
        grid.shuffle(&mut self.rng);
        self.grid = grid;
        self.puzzle = Some(generated.puzzle.clone());
        self.selected.clear();
        self.found.clear();
        self.mistakes_remaining = MAX_MISTAKES;
        self.phase = Phase::Playing;

        renderer.render_grid(&self.grid);
        renderer.render_mistake_counter(self.mistakes_remaining);
        Ok(generated)
    }

    /// Selects `text`, or deselects it if already selected.
    pub fn toggle(&mut self, text: &str) -> Result<Toggle, SessionError> {
        self.ensure_playing()?;
        if !self.grid.iter().any(|expression| expression == text) {
            return Err(SessionError::UnknownExpression(text.to_string()));
        }
        if let Some(pos) = self.selected.iter().position(|selected| selected == text) {
            self.selected.remove(pos);
            Ok(Toggle::Deselected)
        } else if self.selected.len() < MAX_SELECTION {
            self.selected.push(text.to_string());
            Ok(Toggle::Selected)
        } else {
            Ok(Toggle::Ignored)
        }
    }

    pub fn deselect_all(&mut self) -> Result<(), SessionError> {
        self.ensure_playing()?;
        self.selected.clear();
        Ok(())
    }

    /// Reorders the remaining board and clears the selection.
    pub fn shuffle(&mut self, renderer: &mut dyn Renderer) -> Result<(), SessionError> {
        self.ensure_idle()?;
        if self.puzzle.is_none() {
            return Err(SessionError::NotPlaying);
        }
        self.grid.shuffle(&mut self.rng);
        self.selected.clear();
        renderer.render_grid(&self.grid);
        Ok(())
    }

    pub fn submit(&mut self, renderer: &mut dyn Renderer) -> Result<SubmitOutcome, SessionError> {
        self.ensure_playing()?;
        if self.selected.len() != MAX_SELECTION {
            return Err(SessionError::IncompleteSelection(self.selected.len()));
        }

        let matched = self
            .unfound_groups()
            .into_iter()
            .find(|group| group.matches(&self.selected))
            .cloned();

        let outcome = match matched {
            Some(group) => self.accept_group(group, renderer),
            None => self.record_mistake(renderer),
        };
        debug!(?outcome, "guess submitted");
        Ok(outcome)
    }

    fn accept_group(&mut self, group: Group, renderer: &mut dyn Renderer) -> SubmitOutcome {
        renderer.render_message(&format!("Correct! {}", group.category), Severity::Success);
        self.grid.retain(|text| !group.contains(text));
        self.selected.clear();
        renderer.render_found_group(&group);
        renderer.render_grid(&self.grid);

        let category = group.category.clone();
        self.found.push(group);
        let total = self.puzzle.as_ref().map_or(0, |puzzle| puzzle.groups.len());
        let won = self.found.len() == total;
        if won {
            self.phase = Phase::Won;
            renderer.render_message("Congratulations! You found all groups!", Severity::Success);
        }
        SubmitOutcome::Correct { category, won }
    }

    fn record_mistake(&mut self, renderer: &mut dyn Renderer) -> SubmitOutcome {
        self.mistakes_remaining = self.mistakes_remaining.saturating_sub(1);
        renderer.render_mistake_counter(self.mistakes_remaining);

        let outcome = if self.mistakes_remaining == 0 {
            self.phase = Phase::Lost;
            renderer.render_message("Game Over! No more mistakes remaining.", Severity::Error);
            let unfound: Vec<Group> = self.unfound_groups().into_iter().cloned().collect();
            for group in &unfound {
                renderer.render_found_group(group);
            }
            self.grid.clear();
            renderer.render_grid(&self.grid);
            SubmitOutcome::Lost {
                revealed: unfound.into_iter().map(|group| group.category).collect(),
            }
        } else if self
            .unfound_groups()
            .iter()
            .any(|group| group.overlap(&self.selected) == GROUP_SIZE - 1)
        {
            renderer.render_message("One away from a group!", Severity::Warning);
            SubmitOutcome::OneAway {
                remaining: self.mistakes_remaining,
            }
        } else {
            renderer.render_message(
                &format!("Incorrect. {} mistakes remaining.", self.mistakes_remaining),
                Severity::Error,
            );
            SubmitOutcome::Incorrect {
                remaining: self.mistakes_remaining,
            }
        };
        self.selected.clear();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{NullRenderer, RecordingRenderer, RenderEvent};

    fn playing_session() -> GameSession {
        let mut session = GameSession::seeded(11);
        let mut renderer = NullRenderer;
        session.begin_load(&mut renderer).unwrap();
        session.finish_load(
            LoadedDatabase::from_result("fallback", Ok(Database::fallback())),
            &mut renderer,
        );
        session
            .new_game(&GenerationOptions::default(), &mut renderer)
            .unwrap();
        session
    }

    fn select_all(session: &mut GameSession, texts: &[String]) {
        for text in texts {
            assert_eq!(session.toggle(text).unwrap(), Toggle::Selected);
        }
    }

    /// Four expressions drawn from different groups, none sharing three with one group.
    fn scattered(session: &GameSession) -> Vec<String> {
        session
            .unfound_groups()
            .iter()
            .map(|group| group.expressions[0].clone())
            .collect()
    }

    #[test]
    fn starts_idle_and_requires_database() {
        let mut session = GameSession::seeded(1);
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(
            session.new_game(&GenerationOptions::default(), &mut NullRenderer),
            Err(SessionError::NoDatabase)
        );
    }

    #[test]
    fn new_game_deals_sixteen() {
        let session = playing_session();
        assert_eq!(session.phase(), Phase::Playing);
        assert_eq!(session.grid().len(), 16);
        assert_eq!(session.mistakes_remaining(), MAX_MISTAKES);
        assert!(session.selected().is_empty());
    }

    #[test]
    fn toggle_law_and_cap() {
        let mut session = playing_session();
        let grid = session.grid().to_vec();
        select_all(&mut session, &grid[..3]);
        let before = session.selected().to_vec();
        assert_eq!(session.toggle(&grid[3]).unwrap(), Toggle::Selected);
        assert_eq!(session.toggle(&grid[3]).unwrap(), Toggle::Deselected);
        assert_eq!(session.selected(), before.as_slice());

        session.toggle(&grid[3]).unwrap();
        assert!(session.can_submit());
        let full = session.selected().to_vec();
        assert_eq!(session.toggle(&grid[4]).unwrap(), Toggle::Ignored);
        assert_eq!(session.selected(), full.as_slice());

        assert_eq!(
            session.toggle("not on the board"),
            Err(SessionError::UnknownExpression("not on the board".to_string()))
        );
    }

    #[test]
    fn submit_requires_four() {
        let mut session = playing_session();
        let first = session.grid()[0].clone();
        session.toggle(&first).unwrap();
        assert_eq!(
            session.submit(&mut NullRenderer),
            Err(SessionError::IncompleteSelection(1))
        );
    }

    #[test]
    fn solving_every_group_wins() {
        let mut session = playing_session();
        let groups: Vec<Group> = session.puzzle().unwrap().groups.clone();
        let mut renderer = RecordingRenderer::default();
        for (idx, group) in groups.iter().rev().enumerate() {
            select_all(&mut session, &group.expressions);
            let outcome = session.submit(&mut renderer).unwrap();
            assert_eq!(
                outcome,
                SubmitOutcome::Correct {
                    category: group.category.clone(),
                    won: idx == groups.len() - 1,
                }
            );
        }
        assert_eq!(session.phase(), Phase::Won);
        assert!(session.grid().is_empty());
        assert_eq!(session.found_groups().len(), 4);
        assert!(!session.can_submit());
        assert_eq!(session.submit(&mut renderer), Err(SessionError::NotPlaying));
        assert!(renderer.events().iter().any(|event| matches!(
            event,
            RenderEvent::Message { text, .. } if text.starts_with("Congratulations")
        )));
    }

    #[test]
    fn four_mistakes_lose_and_reveal() {
        let mut session = playing_session();
        let mut renderer = RecordingRenderer::default();
        let first = session.puzzle().unwrap().groups[0].clone();
        select_all(&mut session, &first.expressions);
        session.submit(&mut renderer).unwrap();
        renderer.take();

        for expected_remaining in (0..MAX_MISTAKES).rev() {
            let guess = scattered(&session);
            select_all(&mut session, &guess[..3]);
            // pad with a second member of the first unfound group
            let extra = session.unfound_groups()[0].expressions[1].clone();
            session.toggle(&extra).unwrap();
            let outcome = session.submit(&mut renderer).unwrap();
            assert_eq!(session.mistakes_remaining(), expected_remaining);
            if expected_remaining == 0 {
                assert!(matches!(outcome, SubmitOutcome::Lost { ref revealed } if revealed.len() == 3));
            } else {
                assert_eq!(
                    outcome,
                    SubmitOutcome::Incorrect {
                        remaining: expected_remaining
                    }
                );
            }
        }
        assert_eq!(session.phase(), Phase::Lost);
        assert!(session.grid().is_empty());
        let revealed = renderer
            .events()
            .iter()
            .filter(|event| matches!(event, RenderEvent::FoundGroup { .. }))
            .count();
        assert_eq!(revealed, 3);
        assert_eq!(session.toggle(&first.expressions[0]), Err(SessionError::NotPlaying));
        assert_eq!(session.submit(&mut renderer), Err(SessionError::NotPlaying));
        assert_eq!(session.deselect_all(), Err(SessionError::NotPlaying));
    }

    #[test]
    fn three_of_a_group_is_one_away() {
        let mut session = playing_session();
        let groups = session.puzzle().unwrap().groups.clone();
        select_all(&mut session, &groups[0].expressions[..3]);
        session.toggle(&groups[1].expressions[0]).unwrap();
        let mut renderer = RecordingRenderer::default();
        assert_eq!(
            session.submit(&mut renderer).unwrap(),
            SubmitOutcome::OneAway { remaining: 3 }
        );
        assert!(session.selected().is_empty());
        assert_eq!(session.phase(), Phase::Playing);
        assert!(renderer.events().contains(&RenderEvent::Message {
            text: "One away from a group!".to_string(),
            severity: Severity::Warning,
        }));
    }

    #[test]
    fn busy_session_rejects_actions() {
        let mut session = playing_session();
        let mut renderer = RecordingRenderer::default();
        let picked = session.grid()[0].clone();
        session.toggle(&picked).unwrap();
        session.begin_load(&mut renderer).unwrap();
        assert!(session.is_busy());
        assert_eq!(session.deselect_all(), Err(SessionError::Busy));
        assert_eq!(session.selected(), [picked.clone()].as_slice());
        assert_eq!(session.begin_load(&mut renderer), Err(SessionError::Busy));
        assert_eq!(
            session.new_game(&GenerationOptions::default(), &mut renderer),
            Err(SessionError::Busy)
        );
        assert_eq!(session.shuffle(&mut renderer), Err(SessionError::Busy));
        let text = session.grid()[0].clone();
        assert_eq!(session.toggle(&text), Err(SessionError::Busy));

        session.finish_load(
            LoadedDatabase::from_result("fallback", Ok(Database::fallback())),
            &mut renderer,
        );
        assert_eq!(session.phase(), Phase::Ready);
        assert_eq!(
            renderer.events().first(),
            Some(&RenderEvent::Loading { loading: true })
        );
        assert_eq!(
            renderer.events().last(),
            Some(&RenderEvent::Loading { loading: false })
        );
    }

    #[test]
    fn shuffle_keeps_board_and_clears_selection() {
        let mut session = playing_session();
        let mut before = session.grid().to_vec();
        let first = before[0].clone();
        session.toggle(&first).unwrap();
        session.shuffle(&mut NullRenderer).unwrap();
        assert!(session.selected().is_empty());
        let mut after = session.grid().to_vec();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn switch_database_deals_from_bundle() {
        let mut session = GameSession::seeded(5);
        let generated = session
            .switch_database(
                &DatabaseSource::Bundled,
                "series-strategies",
                &GenerationOptions::default(),
                &mut NullRenderer,
            )
            .unwrap();
        assert_eq!(session.database_id(), Some("series-strategies"));
        assert!(!generated.fell_back);
        assert_eq!(session.phase(), Phase::Playing);
        assert!(!session.is_busy());
    }
}
