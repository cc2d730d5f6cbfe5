//! Fetch modes, cascade styles, fetch profiles and load query influencers.

use std::collections::BTreeSet;

/// Statically mapped fetch strategy of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FetchMode {
    /// Join for to-one associations whose target has no proxy, select otherwise.
    #[default]
    Default,
    /// Always fetch with an outer join.
    Join,
    /// Always fetch with a separate select.
    Select,
}

/// Action that may cascade along an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadingAction {
    Persist,
    Merge,
    Refresh,
    Delete,
    Lock,
}

/// Which actions cascade along an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CascadeStyle {
    #[default]
    None,
    All,
    AllDeleteOrphan,
    Persist,
    Merge,
    Refresh,
    Delete,
    Lock,
}

impl CascadeStyle {
    pub const fn does_cascade(self, action: CascadingAction) -> bool {
        match self {
            CascadeStyle::None => false,
            CascadeStyle::All | CascadeStyle::AllDeleteOrphan => true,
            CascadeStyle::Persist => matches!(action, CascadingAction::Persist),
            CascadeStyle::Merge => matches!(action, CascadingAction::Merge),
            CascadeStyle::Refresh => matches!(action, CascadingAction::Refresh),
            CascadeStyle::Delete => matches!(action, CascadingAction::Delete),
            CascadeStyle::Lock => matches!(action, CascadingAction::Lock),
        }
    }
}

/// How a fetch profile wants an association fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchStyle {
    Join,
    Select,
}

/// One association override inside a fetch profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetch {
    /// Owning entity name.
    pub entity: String,
    /// Association path relative to the owning entity (`team` or `address.city`).
    pub association: String,
    pub style: FetchStyle,
}

impl Fetch {
    /// `Entity.path`, the key profiles are looked up by.
    pub fn role(&self) -> String {
        format!("{}.{}", self.entity, self.association)
    }
}

/// A named, runtime-togglable set of fetch overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchProfile {
    name: String,
    fetches: Vec<Fetch>,
}

impl FetchProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fetches: Vec::new(),
        }
    }

    /// Add a join fetch for `entity.association` (builder pattern).
    #[must_use]
    pub fn join(mut self, entity: impl Into<String>, association: impl Into<String>) -> Self {
        self.fetches.push(Fetch {
            entity: entity.into(),
            association: association.into(),
            style: FetchStyle::Join,
        });
        self
    }

    /// Add a select fetch for `entity.association` (builder pattern).
    #[must_use]
    pub fn select(mut self, entity: impl Into<String>, association: impl Into<String>) -> Self {
        self.fetches.push(Fetch {
            entity: entity.into(),
            association: association.into(),
            style: FetchStyle::Select,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fetches(&self) -> &[Fetch] {
        &self.fetches
    }

    /// The fetch registered for an `Entity.path` role, if any.
    pub fn fetch_by_role(&self, role: &str) -> Option<&Fetch> {
        self.fetches.iter().find(|f| f.role() == role)
    }
}

/// Profiles used internally by merge and refresh, which join every
/// association the action cascades to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalFetchProfile {
    Merge,
    Refresh,
}

impl InternalFetchProfile {
    pub const fn cascading_action(self) -> CascadingAction {
        match self {
            InternalFetchProfile::Merge => CascadingAction::Merge,
            InternalFetchProfile::Refresh => CascadingAction::Refresh,
        }
    }
}

/// Session state that changes the SQL a load produces.
///
/// Equal influencers produce equal templates, so the value doubles as part
/// of the loader cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct LoadQueryInfluencers {
    enabled_fetch_profiles: BTreeSet<String>,
    enabled_filters: BTreeSet<String>,
    internal_fetch_profile: Option<InternalFetchProfile>,
}

impl LoadQueryInfluencers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_fetch_profile(&mut self, name: impl Into<String>) {
        self.enabled_fetch_profiles.insert(name.into());
    }

    pub fn disable_fetch_profile(&mut self, name: &str) {
        self.enabled_fetch_profiles.remove(name);
    }

    pub fn is_fetch_profile_enabled(&self, name: &str) -> bool {
        self.enabled_fetch_profiles.contains(name)
    }

    pub fn has_enabled_fetch_profiles(&self) -> bool {
        !self.enabled_fetch_profiles.is_empty()
    }

    pub fn enabled_fetch_profiles(&self) -> impl Iterator<Item = &str> {
        self.enabled_fetch_profiles.iter().map(String::as_str)
    }

    pub fn enable_filter(&mut self, name: impl Into<String>) {
        self.enabled_filters.insert(name.into());
    }

    pub fn disable_filter(&mut self, name: &str) {
        self.enabled_filters.remove(name);
    }

    pub fn is_filter_enabled(&self, name: &str) -> bool {
        self.enabled_filters.contains(name)
    }

    pub fn internal_fetch_profile(&self) -> Option<InternalFetchProfile> {
        self.internal_fetch_profile
    }

    pub fn set_internal_fetch_profile(&mut self, profile: Option<InternalFetchProfile>) {
        self.internal_fetch_profile = profile;
    }
}
