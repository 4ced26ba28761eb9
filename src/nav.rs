//! Page registry of the panel.
//!
//! The overview is always the first page. Security detail pages are added
//! on demand and paged through like any other tab.

use std::collections::HashMap;

use tracing::debug;

pub const OVERVIEW_PAGE: &str = "overview";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageKind {
    Overview,
    SecurityDetail { security_uuid: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub id: String,
    pub title: String,
    pub kind: PageKind,
}

impl Page {
    fn overview() -> Self {
        Self {
            id: OVERVIEW_PAGE.to_string(),
            title: "Dashboard".to_string(),
            kind: PageKind::Overview,
        }
    }
}

pub fn security_page_id(security_uuid: &str) -> String {
    format!("security:{security_uuid}")
}

#[derive(Debug)]
pub struct TabRegistry {
    pages: Vec<Page>,
    current: usize,
    scroll_positions: HashMap<String, f64>,
}

impl Default for TabRegistry {
    fn default() -> Self {
        Self {
            pages: vec![Page::overview()],
            current: 0,
            scroll_positions: HashMap::new(),
        }
    }
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn current(&self) -> &Page {
        &self.pages[self.current.min(self.pages.len() - 1)]
    }

    pub fn next_page(&mut self) -> &Page {
        self.current = (self.current + 1) % self.pages.len();
        self.current()
    }

    pub fn previous_page(&mut self) -> &Page {
        self.current = (self.current + self.pages.len() - 1) % self.pages.len();
        self.current()
    }

    pub fn select(&mut self, page_id: &str) -> bool {
        match self.pages.iter().position(|p| p.id == page_id) {
            Some(index) => {
                self.current = index;
                true
            }
            None => false,
        }
    }

    /// Adds a detail page for a security, or returns the existing one.
    /// The new page becomes the current page.
    pub fn register_security_tab(&mut self, security_uuid: &str, name: &str) -> &Page {
        let id = security_page_id(security_uuid);
        let index = match self.pages.iter().position(|p| p.id == id) {
            Some(index) => index,
            None => {
                debug!(security = security_uuid, "registering security detail tab");
                self.pages.push(Page {
                    id,
                    title: name.to_string(),
                    kind: PageKind::SecurityDetail {
                        security_uuid: security_uuid.to_string(),
                    },
                });
                self.pages.len() - 1
            }
        };
        self.current = index;
        &self.pages[index]
    }

    /// Removes a detail page. The overview cannot be removed.
    pub fn unregister_security_tab(&mut self, security_uuid: &str) -> bool {
        let id = security_page_id(security_uuid);
        let Some(index) = self.pages.iter().position(|p| p.id == id) else {
            return false;
        };
        self.pages.remove(index);
        self.scroll_positions.remove(&id);
        if self.current >= index && self.current > 0 {
            self.current -= 1;
        }
        true
    }

    pub fn remember_scroll_position(&mut self, page_id: &str, position: f64) {
        self.scroll_positions.insert(page_id.to_string(), position.max(0.0));
    }

    pub fn scroll_position(&self, page_id: &str) -> f64 {
        self.scroll_positions.get(page_id).copied().unwrap_or(0.0)
    }
}
