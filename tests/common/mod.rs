//! Shared entities and helpers for integration tests.
#![allow(dead_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cqbus::crud::Entity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_status() -> String {
    "active".to_string()
}

impl NewProject {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: default_status(),
            description: None,
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }
}

impl Entity for Project {
    const KIND: &'static str = "project";
    type Input = NewProject;

    fn from_input(id: Uuid, created_at: DateTime<Utc>, input: NewProject) -> Self {
        Self {
            id,
            name: input.name,
            status: input.status,
            description: input.description,
            created_at,
        }
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub age: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    #[serde(default)]
    pub age: i64,
}

impl Entity for User {
    const KIND: &'static str = "user";
    type Input = NewUser;

    fn from_input(id: Uuid, created_at: DateTime<Utc>, input: NewUser) -> Self {
        Self {
            id,
            email: input.email,
            age: input.age,
            created_at,
        }
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Upper bound for waits in tests running on the real clock.
pub const WAIT: Duration = Duration::from_secs(10);
