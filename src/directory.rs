//! Read access to users and rooms, which are owned by the account and room
//! administration services.
//!
//! Membership is always read at call time; nothing here caches.

use crate::error::AppResult;
use crate::models::{Room, RoomId, User};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait Directory: Send + Sync {
    async fn user(&self, user_id: &str) -> AppResult<Option<User>>;

    /// The room with its current member list.
    async fn room(&self, room_id: &str) -> AppResult<Option<Room>>;

    /// Ids of the rooms `user_id` currently belongs to.
    async fn rooms_of(&self, user_id: &str) -> AppResult<Vec<RoomId>>;
}

/// Directory over the `users`, `rooms` and `room_members` tables.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the directory tables when running against an empty database.
    /// The owning services normally provide them.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                full_name TEXT NOT NULL,
                preferred_language TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS room_members (
                room_id TEXT NOT NULL REFERENCES rooms(id),
                user_id TEXT NOT NULL REFERENCES users(id),
                joined_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (room_id, user_id)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create directory schema")?;
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn user(&self, user_id: &str) -> AppResult<Option<User>> {
        let row: Option<(String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, full_name, preferred_language
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, full_name, preferred_language)| User {
            id,
            full_name,
            preferred_language,
        }))
    }

    async fn room(&self, room_id: &str) -> AppResult<Option<Room>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, name
            FROM rooms
            WHERE id = $1
            "#,
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, name)) = row else {
            return Ok(None);
        };

        let members: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT user_id
            FROM room_members
            WHERE room_id = $1
            ORDER BY joined_at, user_id
            "#,
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Room {
            id,
            name,
            members: members.into_iter().map(|(user_id,)| user_id).collect(),
        }))
    }

    async fn rooms_of(&self, user_id: &str) -> AppResult<Vec<RoomId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT room_id
            FROM room_members
            WHERE user_id = $1
            ORDER BY room_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(room_id,)| room_id).collect())
    }
}

/// In-process directory with mutable membership, for tests and embedding.
#[derive(Default)]
pub struct MemoryDirectory {
    users: RwLock<HashMap<String, User>>,
    rooms: RwLock<HashMap<String, Room>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.users.write().await.insert(user.id.clone(), user);
    }

    pub async fn insert_room(&self, room: Room) {
        self.rooms.write().await.insert(room.id.clone(), room);
    }

    /// Returns false if the room does not exist.
    pub async fn add_member(&self, room_id: &str, user_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(room_id) {
            Some(room) => {
                if !room.is_member(user_id) {
                    room.members.push(user_id.to_string());
                }
                true
            }
            None => false,
        }
    }

    pub async fn remove_member(&self, room_id: &str, user_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(room_id) {
            Some(room) => {
                room.members.retain(|member| member != user_id);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn user(&self, user_id: &str) -> AppResult<Option<User>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn room(&self, room_id: &str) -> AppResult<Option<Room>> {
        Ok(self.rooms.read().await.get(room_id).cloned())
    }

    async fn rooms_of(&self, user_id: &str) -> AppResult<Vec<RoomId>> {
        let mut rooms: Vec<RoomId> = self
            .rooms
            .read()
            .await
            .values()
            .filter(|room| room.is_member(user_id))
            .map(|room| room.id.clone())
            .collect();
        rooms.sort();
        Ok(rooms)
    }
}
