//! Sellable games and denominations with their IDR prices.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denomination {
    pub code: String,
    pub label: String,
    /// Whole rupiah
    pub price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub title: String,
    /// Routing key for the publisher credit API
    pub publisher: String,
    pub denominations: Vec<Denomination>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog file {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid catalog: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    games: Vec<Game>,
}

/// Immutable product list, looked up by `(game_id, denom_code)`.
#[derive(Debug, Clone)]
pub struct Catalog {
    games: HashMap<String, Game>,
}

impl Catalog {
    pub fn new(games: Vec<Game>) -> Result<Self, CatalogError> {
        let mut by_id = HashMap::with_capacity(games.len());
        for game in games {
            if game.id.trim().is_empty() || game.publisher.trim().is_empty() {
                return Err(CatalogError::Invalid(
                    "game id and publisher must not be empty".to_string(),
                ));
            }
            if let Some(denom) = game.denominations.iter().find(|d| d.price <= 0) {
                return Err(CatalogError::Invalid(format!(
                    "denomination {}/{} must have a positive price",
                    game.id, denom.code
                )));
            }
            if by_id.contains_key(&game.id) {
                return Err(CatalogError::Invalid(format!("duplicate game '{}'", game.id)));
            }
            by_id.insert(game.id.clone(), game);
        }
        Ok(Self { games: by_id })
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            serde_json::from_str(raw).map_err(|e| CatalogError::Invalid(e.to_string()))?;
        Self::new(file.games)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| CatalogError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&raw)
    }

    pub fn game(&self, game_id: &str) -> Option<&Game> {
        self.games.get(game_id)
    }

    pub fn denomination(&self, game_id: &str, denom_code: &str) -> Option<&Denomination> {
        self.game(game_id)?
            .denominations
            .iter()
            .find(|d| d.code == denom_code)
    }

    pub fn price_for(&self, game_id: &str, denom_code: &str) -> Option<i64> {
        self.denomination(game_id, denom_code).map(|d| d.price)
    }

    pub fn publisher_for(&self, game_id: &str) -> Option<&str> {
        self.game(game_id).map(|g| g.publisher.as_str())
    }

    pub fn publishers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.games.values().map(|g| g.publisher.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

fn denom(code: &str, label: &str, price: i64) -> Denomination {
    Denomination {
        code: code.to_string(),
        label: label.to_string(),
        price,
    }
}

impl Default for Catalog {
    fn default() -> Self {
        let games = vec![
            Game {
                id: "mlbb".to_string(),
                title: "Mobile Legends: Bang Bang".to_string(),
                publisher: "moonton".to_string(),
                denominations: vec![
                    denom("86dm", "86 Diamonds", 20_000),
                    denom("172dm", "172 Diamonds", 40_000),
                    denom("257dm", "257 Diamonds", 60_000),
                    denom("706dm", "706 Diamonds", 160_000),
                ],
            },
            Game {
                id: "ff".to_string(),
                title: "Free Fire".to_string(),
                publisher: "garena".to_string(),
                denominations: vec![
                    denom("70dm", "70 Diamonds", 10_000),
                    denom("140dm", "140 Diamonds", 20_000),
                    denom("355dm", "355 Diamonds", 50_000),
                ],
            },
            Game {
                id: "genshin".to_string(),
                title: "Genshin Impact".to_string(),
                publisher: "hoyoverse".to_string(),
                denominations: vec![
                    denom("60gc", "60 Genesis Crystals", 16_000),
                    denom("330gc", "300+30 Genesis Crystals", 79_000),
                    denom("welkin", "Blessing of the Welkin Moon", 79_000),
                ],
            },
            Game {
                id: "hsr".to_string(),
                title: "Honkai: Star Rail".to_string(),
                publisher: "hoyoverse".to_string(),
                denominations: vec![
                    denom("60os", "60 Oneiric Shards", 16_000),
                    denom("express", "Express Supply Pass", 79_000),
                ],
            },
        ];

        let games = games.into_iter().map(|g| (g.id.clone(), g)).collect();
        Self { games }
    }
}
