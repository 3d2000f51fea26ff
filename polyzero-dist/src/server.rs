//! Distribution server: model registry, ratings, train-data intake

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;

use polyzero_core::StateDict;

use crate::message::Message;
use crate::rating::{elo_adjustment, sample_rating_weighted};
use crate::reqrep::{ReqRepServer, ServerCallback};
use crate::DistError;

/// The distinguished id of the currently-training model.
pub const DEV_MODEL_ID: &str = "dev";

const RATING_PRINT_INTERVAL: Duration = Duration::from_secs(120);

/// One registered model.
pub struct ModelInfo {
    pub id: String,
    pub version: i32,
    pub rating: f32,
    pub state_dict: StateDict,
}

// ============================================================================
// REGISTRY
// ============================================================================

struct Registry {
    models: FxHashMap<String, ModelInfo>,
    rng: ChaCha8Rng,
    last_rating_print: Instant,
}

impl Registry {
    fn new(seed: u64) -> Self {
        Self {
            models: FxHashMap::default(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            last_rating_print: Instant::now(),
        }
    }

    fn sample_model_id(&mut self) -> String {
        let ratings: Vec<(String, f32)> = self
            .models
            .iter()
            .map(|(id, m)| (id.clone(), m.rating))
            .collect();
        sample_rating_weighted(&ratings, &mut self.rng)
            .unwrap_or_else(|| DEV_MODEL_ID.to_string())
    }

    fn update_model(&mut self, id: &str, state_dict: StateDict) {
        if !self.models.contains_key(id) {
            let rating = if id == DEV_MODEL_ID {
                0.0
            } else {
                // New opponents enter a notch below the training model.
                self.models
                    .get(DEV_MODEL_ID)
                    .map_or(0.0, |dev| dev.rating - 100.0)
            };
            self.models.insert(
                id.to_string(),
                ModelInfo {
                    id: id.to_string(),
                    version: 0,
                    rating,
                    state_dict: StateDict::default(),
                },
            );
        }
        let model = self.models.get_mut(id).unwrap();
        model.state_dict = state_dict;
        model.version += 1;
    }

    /// Elo update of `id` against "dev", weighted by the move ratio.
    fn add_result(&mut self, id: &str, ratio: f32, reward: f32) {
        if ratio < 0.9 || id == DEV_MODEL_ID {
            return;
        }
        if !self.models.contains_key(id) || !self.models.contains_key(DEV_MODEL_ID) {
            return;
        }

        let rating = self.models[id].rating;
        let dev_rating = self.models[DEV_MODEL_ID].rating;
        let delta = elo_adjustment(reward, dev_rating - rating) * ratio;
        let dev_delta = elo_adjustment(-reward, rating - dev_rating) * ratio;

        self.models.get_mut(id).unwrap().rating = rating + delta;
        self.models.get_mut(DEV_MODEL_ID).unwrap().rating = dev_rating + dev_delta;

        if self.last_rating_print.elapsed() >= RATING_PRINT_INTERVAL {
            self.last_rating_print = Instant::now();
            self.print_ratings();
        }
    }

    fn print_ratings(&self) {
        let mut sorted: Vec<(f32, &str)> = self
            .models
            .values()
            .map(|m| (m.rating, m.id.as_str()))
            .collect();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        let dev_rank = sorted
            .iter()
            .position(|(_, id)| *id == DEV_MODEL_ID)
            .map(|i| i + 1);

        let mut table = String::new();
        for (rank, (rating, id)) in sorted.iter().take(10).enumerate() {
            table.push_str(&format!("{}. {} {}\n", rank + 1, rating, id));
        }
        if let Some(rank) = dev_rank.filter(|r| *r > 10) {
            let rating = self.models[DEV_MODEL_ID].rating;
            table.push_str(&format!("{rank}. {rating} {DEV_MODEL_ID}\n"));
        }
        tracing::info!("Top 10:\n{}", table);
    }

    fn handle(&mut self, msg: Message, on_train_data: &dyn Fn(&[u8])) -> Message {
        match msg {
            Message::RequestModel {
                want_new,
                model_id,
            } => {
                let mut model_id = if want_new {
                    self.sample_model_id()
                } else {
                    model_id
                };
                if !self.models.contains_key(&model_id) {
                    model_id = DEV_MODEL_ID.to_string();
                }
                let version = self.models.get(&model_id).map_or(-1, |m| m.version);
                Message::ReplyModel { model_id, version }
            }
            Message::RequestStateDict { model_id } => match self.models.get(&model_id) {
                Some(model) => Message::ReplyStateDict {
                    found: true,
                    state_dict: Some(model.state_dict.clone()),
                },
                None => Message::ReplyStateDict {
                    found: false,
                    state_dict: None,
                },
            },
            Message::TrainData { blob } => {
                on_train_data(&blob);
                Message::Null
            }
            Message::GameResult { results } => {
                for outcome in results {
                    for (id, ratio) in outcome.ratios {
                        self.add_result(&id, ratio, outcome.reward);
                    }
                }
                Message::Null
            }
            other => {
                tracing::warn!("distributed server ignoring unexpected message {:?}", other);
                Message::Null
            }
        }
    }
}

// ============================================================================
// SERVER
// ============================================================================

/// Request/reply front of the model exchange.
pub struct DistributedServer {
    registry: Arc<Mutex<Registry>>,
    server: ReqRepServer,
}

impl DistributedServer {
    /// Bind and start serving. `on_train_data` receives every training blob
    /// shipped by clients, opaque.
    pub async fn start(
        endpoint: Option<&str>,
        on_train_data: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<Self, DistError> {
        let registry = Arc::new(Mutex::new(Registry::new(rand::random())));

        let handler_registry = Arc::clone(&registry);
        let on_train_data = Arc::new(on_train_data);
        let callback: ServerCallback = Arc::new(move |payload| match Message::decode(payload) {
            Ok(msg) => Some(
                handler_registry
                    .lock()
                    .handle(msg, on_train_data.as_ref())
                    .encode(),
            ),
            Err(e) => {
                tracing::warn!("distributed server dropping bad message: {}", e);
                None
            }
        });

        let server = ReqRepServer::bind(endpoint, callback).await?;
        Ok(Self { registry, server })
    }

    pub fn endpoint(&self) -> String {
        self.server.endpoint()
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    /// Register or refresh a model; new ids start rated 100 below "dev".
    pub fn update_model(&self, id: &str, state_dict: StateDict) {
        self.registry.lock().update_model(id, state_dict);
    }

    /// Apply one game result (the trainer-side entry point; network clients
    /// go through GameResult messages).
    pub fn apply_result(&self, id: &str, ratio: f32, reward: f32) {
        self.registry.lock().add_result(id, ratio, reward);
    }

    pub fn rating(&self, id: &str) -> Option<f32> {
        self.registry.lock().models.get(id).map(|m| m.rating)
    }

    pub fn version(&self, id: &str) -> Option<i32> {
        self.registry.lock().models.get(id).map(|m| m.version)
    }
}

// ============================================================================
// TESTS
// ============================================================================
