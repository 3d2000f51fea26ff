//! Distribution client: model adoption and result reporting

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use polyzero_core::StateDict;

use crate::message::{GameOutcome, Message};
use crate::reqrep::ReqRepClient;
use crate::server::DEV_MODEL_ID;
use crate::DistError;

/// Games with one model (at full move ratio) before the client asks the
/// server for a fresh tournament opponent.
const GAMES_PER_MODEL: i32 = 8;

const MAX_CONCURRENT_REQUESTS: usize = 50;

/// Called when a fetched state dict should be loaded into the evaluator.
pub type UpdateModelFn = Box<dyn Fn(&str, StateDict) + Send + Sync>;

struct ClientState {
    current_model_id: String,
    current_model_version: i32,
    games_done_with_current_model: i32,
    wants_new_model_id: bool,
    result_queue: Vec<GameOutcome>,
}

/// Self-play side of the model exchange.
///
/// Tracks the model it is currently playing, adopts server-chosen opponents
/// in tournament mode, fetches state dicts on version changes, and ships
/// queued game results piggybacked on the next model request.
pub struct DistributedClient {
    reqrep: ReqRepClient,
    state: Mutex<ClientState>,
    on_update_model: Mutex<Option<UpdateModelFn>>,
}

impl DistributedClient {
    /// Must be called from within a tokio runtime.
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            reqrep: ReqRepClient::new(MAX_CONCURRENT_REQUESTS, endpoints),
            state: Mutex::new(ClientState {
                current_model_id: DEV_MODEL_ID.to_string(),
                current_model_version: -1,
                games_done_with_current_model: 0,
                wants_new_model_id: false,
                result_queue: Vec::new(),
            }),
            on_update_model: Mutex::new(None),
        }
    }

    /// Install the state-dict sink. Set this before `connect`.
    pub fn set_on_update_model(&self, f: impl Fn(&str, StateDict) + Send + Sync + 'static) {
        *self.on_update_model.lock() = Some(Box::new(f));
    }

    /// Initial handshake: fetch the current model.
    pub async fn connect(&self) -> Result<(), DistError> {
        self.request_model(false).await
    }

    /// Flush queued results, then ask the server which model to play.
    ///
    /// Only a tournament request may consume the pending wish for a new
    /// opponent; self-play requests always stay on the current model.
    pub async fn request_model(&self, is_tournament_opponent: bool) -> Result<(), DistError> {
        let flush = {
            let mut state = self.state.lock();
            if state.result_queue.is_empty() {
                None
            } else {
                Some(Message::GameResult {
                    results: std::mem::take(&mut state.result_queue),
                })
            }
        };
        if let Some(msg) = flush {
            self.roundtrip(msg).await?;
        }

        let request = {
            let mut state = self.state.lock();
            Message::RequestModel {
                want_new: if is_tournament_opponent {
                    std::mem::take(&mut state.wants_new_model_id)
                } else {
                    false
                },
                model_id: state.current_model_id.clone(),
            }
        };
        self.roundtrip(request).await
    }

    /// Ship an opaque training blob to the trainer.
    pub async fn send_train_data(&self, data: &[u8]) -> Result<(), DistError> {
        self.roundtrip(Message::TrainData {
            blob: data.to_vec(),
        })
        .await
    }

    /// Queue one game result for the next outbound request.
    pub fn send_result(&self, reward: f32, ratios: FxHashMap<String, f32>) {
        let mut state = self.state.lock();
        if let Some(&ratio) = ratios.get(&state.current_model_id) {
            if ratio >= 0.9 {
                state.games_done_with_current_model += 1;
                if state.games_done_with_current_model >= GAMES_PER_MODEL {
                    state.wants_new_model_id = true;
                }
            }
        }
        state.result_queue.push(GameOutcome { reward, ratios });
    }

    pub fn model_id(&self) -> String {
        self.state.lock().current_model_id.clone()
    }

    pub fn model_version(&self) -> i32 {
        self.state.lock().current_model_version
    }

    pub fn set_reply_timeout_ms(&self, timeout: u64) {
        self.reqrep.set_reply_timeout_ms(timeout);
    }

    pub fn set_max_retries(&self, count: u32) {
        self.reqrep.set_max_retries(count);
    }

    /// Send a request and walk the reply chain (a model reply may require a
    /// follow-up state-dict fetch).
    async fn roundtrip(&self, msg: Message) -> Result<(), DistError> {
        let mut current = msg;
        loop {
            let reply = self.reqrep.request(current.encode()).await?;
            match self.recv(Message::decode(&reply)?) {
                Some(next) => current = next,
                None => return Ok(()),
            }
        }
    }

    /// Reply state machine; returns the follow-up request, if any.
    fn recv(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::ReplyModel { model_id, version } => {
                let mut state = self.state.lock();
                if state.current_model_id != model_id {
                    state.current_model_id = model_id;
                    state.current_model_version = -1;
                    state.games_done_with_current_model = 0;
                }
                if version != state.current_model_version {
                    state.current_model_version = version;
                    Some(Message::RequestStateDict {
                        model_id: state.current_model_id.clone(),
                    })
                } else {
                    None
                }
            }
            Message::ReplyStateDict { found, state_dict } => {
                if !found {
                    let mut state = self.state.lock();
                    state.current_model_id = DEV_MODEL_ID.to_string();
                    state.current_model_version = -1;
                } else {
                    let model_id = self.state.lock().current_model_id.clone();
                    if let Some(callback) = &*self.on_update_model.lock() {
                        callback(&model_id, state_dict.unwrap_or_default());
                    }
                }
                None
            }
            Message::Null => None,
            other => {
                tracing::warn!("distributed client ignoring unexpected reply {:?}", other);
                None
            }
        }
    }
}
