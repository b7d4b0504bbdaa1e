//! Meal cost splitting conversation.
//!
//! One meal per session moves through purchaser → participants → bill.
//! Settled meals are written to the [`Ledger`].

pub mod ledger;

use anyhow::Result;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::dispatcher::{handler_fn, Handler, HandlerRegistry};
use crate::error::DispatchError;
use crate::platform::{Markup, Reply};
use crate::update::{SessionId, Update};

pub use self::ledger::Ledger;
use self::ledger::MealRecord;

const WELCOME: &str = "Welcome to Meal Cost Distribution Bot! \
    Use /start_meal to begin tracking a new meal's participants.";
const HINT: &str = "I didn't catch that. Use /start_meal to begin tracking a new meal, \
    or /cancel to stop the current one.";
const NOT_COLLECTING: &str =
    "That command only works while adding participants. Use /start_meal to begin.";

/// Names per row on the removal keyboard
const KEYBOARD_WIDTH: usize = 3;

/// Where a session's meal is in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Idle,
    AwaitingPurchaser,
    CollectingParticipants,
    RemovingParticipant,
    AwaitingBill,
}

#[derive(Debug)]
struct Meal {
    stage: Stage,
    date: DateTime<Local>,
    purchaser: String,
    /// Insertion order is the display order
    participants: Vec<String>,
}

impl Meal {
    fn new() -> Self {
        Self {
            stage: Stage::AwaitingPurchaser,
            date: Local::now(),
            purchaser: String::new(),
            participants: Vec::new(),
        }
    }

    fn has_participant(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.participants.iter().any(|p| p.to_lowercase() == lower)
    }
}

/// Parse a bill amount; only positive finite numbers are accepted
fn parse_bill(text: &str) -> Option<f64> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|amount| amount.is_finite() && *amount > 0.0)
}

/// Equal share per participant, rounded to cents
fn equal_share(total: f64, participants: usize) -> f64 {
    (total / participants as f64 * 100.0).round() / 100.0
}

/// Per-session meal state plus the ledger settled meals go to
#[derive(Clone)]
pub struct MealBook {
    meals: Arc<Mutex<HashMap<SessionId, Meal>>>,
    ledger: Ledger,
}

impl MealBook {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            meals: Arc::new(Mutex::new(HashMap::new())),
            ledger,
        }
    }

    #[cfg(test)]
    pub async fn stage(&self, session: &SessionId) -> Stage {
        self.meals
            .lock()
            .await
            .get(session)
            .map(|meal| meal.stage)
            .unwrap_or_default()
    }

    pub fn welcome(&self) -> Reply {
        Reply::text(WELCOME)
    }

    pub fn hint(&self) -> Reply {
        Reply::text(HINT)
    }

    /// Start a fresh meal, discarding any meal in progress
    pub async fn start_meal(&self, session: &SessionId) -> Reply {
        self.meals.lock().await.insert(session.clone(), Meal::new());
        debug!("Session {} started a meal", session);
        Reply::text(
            "Starting a new meal. First, let's collect the purchaser's information.\n\n\
             Please enter the purchaser's name:",
        )
    }

    /// Plain text, interpreted according to the session's stage
    pub async fn text(&self, session: &SessionId, text: &str) -> Reply {
        let text = text.trim();
        let mut meals = self.meals.lock().await;
        let Some(meal) = meals.get_mut(session) else {
            return self.hint();
        };

        let stage = meal.stage;
        match stage {
            Stage::Idle => self.hint(),
            Stage::AwaitingPurchaser => {
                meal.purchaser = text.to_string();
                meal.stage = Stage::CollectingParticipants;
                Reply::text(format!(
                    "Thanks, {}. Purchaser information recorded. Now, please enter the names \
                     of all participants, one name per message. Use /remove to remove a \
                     participant, /list to see current participants, or /done when finished.",
                    meal.purchaser
                ))
            }
            Stage::CollectingParticipants => {
                if meal.has_participant(text) {
                    return Reply::text(format!("{} is already in the participant list.", text));
                }
                meal.participants.push(text.to_string());
                Reply::text(format!("Added {} to the meal.", text))
            }
            Stage::RemovingParticipant => {
                meal.stage = Stage::CollectingParticipants;
                let reply = match meal.participants.iter().position(|p| p == text) {
                    Some(index) => {
                        meal.participants.remove(index);
                        format!("Removed {} from the meal participants.", text)
                    }
                    None => format!("Participant {} not found.", text),
                };
                Reply::text(reply).with_markup(Markup::RemoveKeyboard)
            }
            Stage::AwaitingBill => {
                let Some(total) = parse_bill(text) else {
                    return Reply::text("Invalid bill amount. Please enter a valid number.");
                };
                let Some(meal) = meals.remove(session) else {
                    return self.hint();
                };
                drop(meals);
                self.settle(session, meal, total).await
            }
        }
    }

    async fn settle(&self, session: &SessionId, meal: Meal, total: f64) -> Reply {
        let share = equal_share(total, meal.participants.len());

        let mut summary = String::from("Bill Split:\n");
        for name in &meal.participants {
            summary.push_str(&format!("{}: ${:.2}\n", name, share));
        }
        summary.push_str(&format!("\nTotal Bill: ${:.2}", total));

        let record = MealRecord {
            session: session.clone(),
            meal_date: meal.date,
            purchaser: meal.purchaser,
            total_bill: total,
            participants: meal.participants,
            individual_share: share,
        };
        match self.ledger.record(&record).await {
            Ok(id) => info!("Session {} settled meal {} ({:.2})", session, id, total),
            Err(e) => error!("Failed to record meal for session {}: {:#}", session, e),
        }

        Reply::text(summary)
    }

    /// Offer a keyboard of participants to remove
    pub async fn remove(&self, session: &SessionId) -> Reply {
        let mut meals = self.meals.lock().await;
        let Some(meal) = meals
            .get_mut(session)
            .filter(|meal| meal.stage == Stage::CollectingParticipants)
        else {
            return Reply::text(NOT_COLLECTING);
        };

        if meal.participants.is_empty() {
            return Reply::text("No participants to remove. Add participants first.");
        }

        let rows = meal
            .participants
            .chunks(KEYBOARD_WIDTH)
            .map(|row| row.to_vec())
            .collect();
        meal.stage = Stage::RemovingParticipant;
        Reply::text("Select a participant to remove:").with_markup(Markup::Keyboard(rows))
    }

    pub async fn list(&self, session: &SessionId) -> Reply {
        let meals = self.meals.lock().await;
        match meals.get(session) {
            Some(meal) if !meal.participants.is_empty() => Reply::text(format!(
                "Current participants:\n{}",
                meal.participants.join("\n")
            )),
            _ => Reply::text("No participants added yet."),
        }
    }

    /// Close the participant list and ask for the bill
    pub async fn done(&self, session: &SessionId) -> Reply {
        let mut meals = self.meals.lock().await;
        let Some(meal) = meals
            .get_mut(session)
            .filter(|meal| meal.stage == Stage::CollectingParticipants)
        else {
            return Reply::text(NOT_COLLECTING);
        };

        if meal.participants.is_empty() {
            return Reply::text("No participants added. Please add participants first.");
        }

        meal.stage = Stage::AwaitingBill;
        Reply::text(format!(
            "Participants for this meal: {}\nNow, please send the total bill amount.",
            meal.participants.join(", ")
        ))
    }

    pub async fn cancel(&self, session: &SessionId) -> Reply {
        if self.meals.lock().await.remove(session).is_some() {
            debug!("Session {} cancelled its meal", session);
        }
        Reply::text("Meal tracking cancelled.").with_markup(Markup::RemoveKeyboard)
    }

    /// How many meals this session has settled
    pub async fn history(&self, session: &SessionId) -> Result<Reply> {
        let count = self.ledger.count(session).await?;
        let text = match count {
            0 => "No meals recorded in this chat yet.".to_string(),
            1 => "1 meal recorded in this chat.".to_string(),
            n => format!("{} meals recorded in this chat.", n),
        };
        Ok(Reply::text(text))
    }
}

/// Adapt a `MealBook` method call into a handler
fn bind<F, Fut>(book: &MealBook, f: F) -> Arc<dyn Handler>
where
    F: Fn(MealBook, Update) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Reply>>> + Send + 'static,
{
    let book = book.clone();
    handler_fn(move |update| f(book.clone(), update))
}

/// Install the meal commands, the text handler and the fallback hint.
/// `/start` replaces any generic welcome already in the registry.
pub fn register(registry: &mut HandlerRegistry, book: &MealBook) -> Result<(), DispatchError> {
    registry.register_override(
        "/start",
        bind(book, |book, _update| async move { Ok(Some(book.welcome())) }),
    );
    registry.register(
        "/start_meal",
        bind(book, |book, update| async move {
            Ok(Some(book.start_meal(&update.source).await))
        }),
    )?;
    registry.register(
        "/remove",
        bind(book, |book, update| async move {
            Ok(Some(book.remove(&update.source).await))
        }),
    )?;
    registry.register(
        "/list",
        bind(book, |book, update| async move {
            Ok(Some(book.list(&update.source).await))
        }),
    )?;
    registry.register(
        "/done",
        bind(book, |book, update| async move {
            Ok(Some(book.done(&update.source).await))
        }),
    )?;
    registry.register(
        "/cancel",
        bind(book, |book, update| async move {
            Ok(Some(book.cancel(&update.source).await))
        }),
    )?;
    registry.register(
        "/history",
        bind(book, |book, update| async move {
            book.history(&update.source).await.map(Some)
        }),
    )?;
    registry.register(
        "text",
        bind(book, |book, update| async move {
            let Some(text) = update.text() else {
                return Ok(Some(book.hint()));
            };
            Ok(Some(book.text(&update.source, text).await))
        }),
    )?;
    registry.set_fallback(bind(book, |book, _update| async move {
        Ok(Some(book.hint()))
    }));
    Ok(())
}
