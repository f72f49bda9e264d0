//! Per-session entity cache served to late joiners.

use std::collections::HashMap;

use serde::{Serialize, Serializer};

use crate::events::{InteractEvent, InteractionType, UpdateEvent};
use crate::ids::EntityId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(serialize_with = "latest_or_empty")]
    pub latest: Option<UpdateEvent>,
    pub render: bool,
    pub locked: bool,
}

fn latest_or_empty<S: Serializer>(latest: &Option<UpdateEvent>, s: S) -> Result<S::Ok, S::Error> {
    match latest {
        Some(update) => update.serialize(s),
        None => s.collect_seq(std::iter::empty::<()>()),
    }
}

impl Entity {
    fn new(id: EntityId, render: bool) -> Self {
        Self {
            id,
            latest: None,
            render,
            locked: false,
        }
    }
}

/// Effect of an interaction on session-level state outside the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionEffect {
    None,
    SceneChanged(i64),
}

/// Entities in first-reference order.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    entities: Vec<Entity>,
    index: HashMap<EntityId, usize>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.index.get(&id).map(|&i| &self.entities[i])
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id).collect()
    }

    pub fn locked_ids(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|e| e.locked)
            .map(|e| e.id)
            .collect()
    }

    fn entry(&mut self, id: EntityId, render: bool) -> &mut Entity {
        let idx = match self.index.get(&id) {
            Some(&idx) => idx,
            None => {
                self.entities.push(Entity::new(id, render));
                let idx = self.entities.len() - 1;
                self.index.insert(id, idx);
                idx
            }
        };
        &mut self.entities[idx]
    }

    /// Cache an asset update. Returns false for non-asset updates, which
    /// are relayed but never stored.
    pub fn apply_update(&mut self, update: &UpdateEvent) -> bool {
        if !update.is_asset() {
            return false;
        }
        self.entry(update.entity_id, true).latest = Some(update.clone());
        true
    }

    /// Apply an interaction to its target, creating the target with
    /// `render=false` when the code mutates entity flags.
    pub fn apply_interaction(&mut self, interaction: &InteractEvent) -> InteractionEffect {
        let target = interaction.target_id;
        match interaction.kind() {
            Some(InteractionType::RenderStart) => self.entry(target, false).render = true,
            Some(InteractionType::RenderEnd) => self.entry(target, false).render = false,
            Some(InteractionType::Lock) => self.entry(target, false).locked = true,
            Some(InteractionType::Unlock) => self.entry(target, false).locked = false,
            Some(InteractionType::SceneChange) => {
                return InteractionEffect::SceneChanged(target.0)
            }
            _ => {}
        }
        InteractionEffect::None
    }
}
