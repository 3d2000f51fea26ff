//! Tagged protocol messages

use rustc_hash::FxHashMap;

use polyzero_core::StateDict;

use crate::wire::{Deserializer, ProtocolError, Serializer};

const TAG_NULL: u8 = 0;
const TAG_REQUEST_MODEL: u8 = 1;
const TAG_REPLY_MODEL: u8 = 2;
const TAG_REQUEST_STATE_DICT: u8 = 3;
const TAG_REPLY_STATE_DICT: u8 = 4;
const TAG_TRAIN_DATA: u8 = 5;
const TAG_GAME_RESULT: u8 = 6;

/// One finished game: the reward and, per participating model, the fraction
/// of moves it played.
#[derive(Clone, Debug, PartialEq)]
pub struct GameOutcome {
    pub reward: f32,
    pub ratios: FxHashMap<String, f32>,
}

/// Protocol message, one byte tag plus inline-serialised fields.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Null,
    RequestModel {
        want_new: bool,
        model_id: String,
    },
    ReplyModel {
        model_id: String,
        version: i32,
    },
    RequestStateDict {
        model_id: String,
    },
    ReplyStateDict {
        found: bool,
        state_dict: Option<StateDict>,
    },
    TrainData {
        blob: Vec<u8>,
    },
    GameResult {
        results: Vec<GameOutcome>,
    },
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut s = Serializer::new();
        match self {
            Message::Null => s.write_u8(TAG_NULL),
            Message::RequestModel { want_new, model_id } => {
                s.write_u8(TAG_REQUEST_MODEL);
                s.write_bool(*want_new);
                s.write_str(model_id);
            }
            Message::ReplyModel { model_id, version } => {
                s.write_u8(TAG_REPLY_MODEL);
                s.write_str(model_id);
                s.write_i32(*version);
            }
            Message::RequestStateDict { model_id } => {
                s.write_u8(TAG_REQUEST_STATE_DICT);
                s.write_str(model_id);
            }
            Message::ReplyStateDict { found, state_dict } => {
                s.write_u8(TAG_REPLY_STATE_DICT);
                s.write_bool(*found);
                if let Some(state_dict) = state_dict {
                    s.write_state_dict(state_dict);
                }
            }
            Message::TrainData { blob } => {
                s.write_u8(TAG_TRAIN_DATA);
                s.write_bytes(blob);
            }
            Message::GameResult { results } => {
                s.write_u8(TAG_GAME_RESULT);
                for outcome in results {
                    s.write_f32(outcome.reward);
                    s.write_ratio_map(&outcome.ratios);
                }
            }
        }
        s.into_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
        let mut d = Deserializer::new(buf);
        let tag = d.read_u8()?;
        match tag {
            TAG_NULL => Ok(Message::Null),
            TAG_REQUEST_MODEL => Ok(Message::RequestModel {
                want_new: d.read_bool()?,
                model_id: d.read_str()?,
            }),
            TAG_REPLY_MODEL => Ok(Message::ReplyModel {
                model_id: d.read_str()?,
                version: d.read_i32()?,
            }),
            TAG_REQUEST_STATE_DICT => Ok(Message::RequestStateDict {
                model_id: d.read_str()?,
            }),
            TAG_REPLY_STATE_DICT => {
                let found = d.read_bool()?;
                let state_dict = if found { Some(d.read_state_dict()?) } else { None };
                Ok(Message::ReplyStateDict { found, state_dict })
            }
            TAG_TRAIN_DATA => Ok(Message::TrainData {
                blob: d.read_bytes()?,
            }),
            TAG_GAME_RESULT => {
                // Outcomes are packed back to back until the payload ends.
                let mut results = Vec::new();
                while !d.is_empty() {
                    let reward = d.read_f32()?;
                    let ratios = d.read_ratio_map()?;
                    results.push(GameOutcome { reward, ratios });
                }
                Ok(Message::GameResult { results })
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}
