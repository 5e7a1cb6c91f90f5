use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry backend failed: {0}")]
    Backend(String),
    #[error("Invalid animal hint: {0}")]
    InvalidHint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Species {
    Cattle,
    Sheep,
    Goat,
}

impl Species {
    /// Maps a detector class name onto a species, defaulting to cattle.
    pub fn from_class_name(class_name: &str) -> Self {
        match class_name.to_lowercase().as_str() {
            "sheep" => Species::Sheep,
            "goat" => Species::Goat,
            _ => Species::Cattle,
        }
    }
}

/// What the pipeline knows about an observation when asking for its animal.
#[derive(Debug, Clone)]
pub struct AnimalHint {
    pub class_id: u32,
    pub class_name: String,
    pub camera_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnimalRef {
    pub id: u64,
    pub tag_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Animal {
    pub id: u64,
    pub tag_id: String,
    pub species: Species,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Returns the animal an observation belongs to. The returned animal
    /// exists in the registry when this call returns.
    async fn resolve_or_create_animal(&self, hint: &AnimalHint) -> Result<AnimalRef, RegistryError>;
}

/// Registry without tracking: every observation is attributed to the first
/// active animal, and a placeholder is created when none exists.
#[derive(Default)]
pub struct InMemoryRegistry {
    animals: RwLock<Vec<Animal>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tag_id: impl Into<String>, species: Species) -> AnimalRef {
        let mut animals = self.animals.write().await;
        insert_animal(&mut animals, tag_id.into(), species)
    }

    pub async fn animals(&self) -> Vec<Animal> {
        self.animals.read().await.clone()
    }
}

fn insert_animal(animals: &mut Vec<Animal>, tag_id: String, species: Species) -> AnimalRef {
    let id = animals.len() as u64 + 1;
    animals.push(Animal {
        id,
        tag_id: tag_id.clone(),
        species,
        is_active: true,
        created_at: Utc::now(),
    });
    AnimalRef { id, tag_id }
}

fn first_active(animals: &[Animal]) -> Option<AnimalRef> {
    animals.iter().find(|a| a.is_active).map(|a| AnimalRef {
        id: a.id,
        tag_id: a.tag_id.clone(),
    })
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn resolve_or_create_animal(&self, hint: &AnimalHint) -> Result<AnimalRef, RegistryError> {
        if hint.class_name.trim().is_empty() {
            return Err(RegistryError::InvalidHint("empty class name".into()));
        }

        if let Some(animal) = first_active(&self.animals.read().await) {
            return Ok(animal);
        }

        // Re-check under the write lock so concurrent detections share one placeholder.
        let mut animals = self.animals.write().await;
        if let Some(animal) = first_active(&animals) {
            return Ok(animal);
        }

        let tag_id = format!("AUTO-{}-001", hint.class_name.to_uppercase());
        let species = Species::from_class_name(&hint.class_name);
        let animal = insert_animal(&mut animals, tag_id, species);
        tracing::info!(
            animal_id = animal.id,
            camera_id = %hint.camera_id,
            "Auto-created animal {} ({:?})",
            animal.tag_id,
            species
        );
        Ok(animal)
    }
}
