use chrono::NaiveDate;
use sqlx::FromRow;
use std::fmt;

pub use envelope::TimeRange;

/// Class of item a snapshot list holds. Each variant owns a fixed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Artist,
    Track,
    Genre,
    Emotion,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Artist => "artist",
            Category::Track => "track",
            Category::Genre => "genre",
            Category::Emotion => "emotion",
        }
    }

    /// Whether lists of this category carry positions and get rank deltas.
    pub fn is_ranked(&self) -> bool {
        matches!(self, Category::Artist | Category::Track)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedItem {
    pub id: String,
    pub position: i32,
    pub position_change: Option<i32>,
    pub is_new: bool,
}

impl RankedItem {
    /// A freshly received item, before it has been compared to any history.
    pub fn new(id: impl Into<String>, position: i32) -> Self {
        Self {
            id: id.into(),
            position,
            position_change: None,
            is_new: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenreCount {
    pub name: String,
    pub count: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmotionShare {
    pub name: String,
    pub percentage: f64,
    pub track_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopItems {
    Artists(Vec<RankedItem>),
    Tracks(Vec<RankedItem>),
    Genres(Vec<GenreCount>),
    Emotions(Vec<EmotionShare>),
}

impl TopItems {
    pub fn category(&self) -> Category {
        match self {
            TopItems::Artists(_) => Category::Artist,
            TopItems::Tracks(_) => Category::Track,
            TopItems::Genres(_) => Category::Genre,
            TopItems::Emotions(_) => Category::Emotion,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TopItems::Artists(items) | TopItems::Tracks(items) => items.len(),
            TopItems::Genres(genres) => genres.len(),
            TopItems::Emotions(emotions) => emotions.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ranked items, for the categories that have them.
    pub fn ranked(&self) -> Option<&[RankedItem]> {
        match self {
            TopItems::Artists(items) | TopItems::Tracks(items) => Some(items.as_slice()),
            TopItems::Genres(_) | TopItems::Emotions(_) => None,
        }
    }

    /// Same category, with its ranked items replaced.
    pub fn with_ranked(&self, items: Vec<RankedItem>) -> TopItems {
        match self {
            TopItems::Artists(_) => TopItems::Artists(items),
            TopItems::Tracks(_) => TopItems::Tracks(items),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub user_id: String,
    pub category: Category,
    pub time_range: TimeRange,
    pub collected_date: NaiveDate,
}

impl SnapshotKey {
    pub fn new(
        user_id: impl Into<String>,
        category: Category,
        time_range: TimeRange,
        collected_date: NaiveDate,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            category,
            time_range,
            collected_date,
        }
    }

    /// The same list, collected on another day.
    pub fn on(&self, collected_date: NaiveDate) -> Self {
        Self {
            collected_date,
            ..self.clone()
        }
    }
}

/// Result of looking up the list a new snapshot is compared against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviousSnapshot {
    Empty,
    Found(Vec<RankedItem>),
}

impl From<Vec<RankedItem>> for PreviousSnapshot {
    fn from(items: Vec<RankedItem>) -> Self {
        if items.is_empty() {
            PreviousSnapshot::Empty
        } else {
            PreviousSnapshot::Found(items)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopItemsWindow {
    pub time_range: TimeRange,
    pub items: TopItems,
}

/// One decoded queue message, in the order its lists were received.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRequest {
    pub user_id: String,
    pub refresh_token: Option<String>,
    pub windows: Vec<TopItemsWindow>,
}

impl From<envelope::UserSpotifyData> for SnapshotRequest {
    fn from(data: envelope::UserSpotifyData) -> Self {
        let ranked = |items: Vec<envelope::TopItem>| -> Vec<RankedItem> {
            items
                .into_iter()
                .map(|item| RankedItem::new(item.id, item.position))
                .collect()
        };

        let mut windows = Vec::new();

        for window in data.top_artists_data {
            windows.push(TopItemsWindow {
                time_range: window.time_range,
                items: TopItems::Artists(ranked(window.top_items)),
            });
        }

        for window in data.top_tracks_data {
            windows.push(TopItemsWindow {
                time_range: window.time_range,
                items: TopItems::Tracks(ranked(window.top_items)),
            });
        }

        for window in data.top_genres_data {
            let genres = window
                .top_genres
                .into_iter()
                .map(|g| GenreCount {
                    name: g.name,
                    count: g.count,
                })
                .collect();
            windows.push(TopItemsWindow {
                time_range: window.time_range,
                items: TopItems::Genres(genres),
            });
        }

        for window in data.top_emotions_data {
            let emotions = window
                .top_emotions
                .into_iter()
                .map(|e| EmotionShare {
                    name: e.name,
                    percentage: e.percentage,
                    track_id: e.track_id,
                })
                .collect();
            windows.push(TopItemsWindow {
                time_range: window.time_range,
                items: TopItems::Emotions(emotions),
            });
        }

        SnapshotRequest {
            user_id: data.user_id,
            refresh_token: data.refresh_token,
            windows,
        }
    }
}

/// Row shape of `top_artist` / `top_track` as read back for comparison.
#[derive(Debug, Clone, FromRow)]
pub struct RankedRow {
    pub item_id: String,
    pub position: i32,
    pub position_change: Option<i32>,
    pub is_new: bool,
}

impl From<RankedRow> for RankedItem {
    fn from(row: RankedRow) -> Self {
        RankedItem {
            id: row.item_id,
            position: row.position,
            position_change: row.position_change,
            is_new: row.is_new,
        }
    }
}
