use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use derive_where::derive_where;
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::{ServerDescription, ServerType},
};

/// How a caller picks among the servers of a deployment: either by read preference, or by an
/// arbitrary predicate over server descriptions.
#[derive(Clone, derive_more::Display)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// Picks servers by role, tags and replication lag.
    #[display("read preference {_0}")]
    ReadPreference(ReadPreference),

    /// Picks every data-bearing server for which the predicate returns true.
    #[display("custom predicate")]
    Predicate(#[derive_where(skip)] Predicate),
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_preference: ReadPreference) -> Self {
        Self::ReadPreference(read_preference)
    }
}

impl SelectionCriteria {
    /// Criteria matching only the server at `address`.
    pub fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }
}

/// A caller-supplied filter over server descriptions.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerDescription) -> bool>;

/// The labels a replica set member advertises. A member matches a tag set when it carries every
/// pair in it; the empty tag set matches every member.
pub type TagSet = HashMap<String, String>;

/// Which replica set members an operation may be routed to.
///
/// Every mode except `Primary` can narrow its candidates further with [`ReadPreferenceOptions`].
/// The options never apply to the primary itself, even when a mode falls back to it.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// The primary only.
    Primary,

    /// Secondaries only.
    Secondary {
        options: Option<ReadPreferenceOptions>,
    },

    /// The primary, or matching secondaries while there is none.
    PrimaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Matching secondaries, or the primary when none match.
    SecondaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Any matching member, primary or secondary, within the latency window.
    Nearest {
        options: Option<ReadPreferenceOptions>,
    },
}

/// Narrows the members a non-primary [`ReadPreference`] may use.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Tried in order; the first tag set matched by at least one candidate decides the
    /// candidates. Members matching none of them are never chosen.
    pub tag_sets: Option<Vec<TagSet>>,

    /// How far a secondary's replication may trail before it stops being a candidate.
    ///
    /// Must be at least 90 seconds and at least the heartbeat frequency plus the idle write
    /// period. Zero disables the bound.
    pub max_staleness: Option<Duration>,
}

/// One step of a read preference's candidate search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Eligibility {
    /// The current primary, if any. Tags and max staleness are not applied to it.
    Primary,

    /// Members of these types that pass the tag set and max staleness filters.
    Filtered(&'static [ServerType]),
}

const SECONDARIES: &[ServerType] = &[ServerType::RsSecondary];
const DATA_BEARING_MEMBERS: &[ServerType] = &[ServerType::RsPrimary, ServerType::RsSecondary];

impl ReadPreference {
    /// The candidates this mode considers, and what it falls back to when there are none.
    pub(crate) fn eligibility(&self) -> (Eligibility, Option<Eligibility>) {
        match self {
            Self::Primary => (Eligibility::Primary, None),
            Self::Secondary { .. } => (Eligibility::Filtered(SECONDARIES), None),
            Self::PrimaryPreferred { .. } => {
                (Eligibility::Primary, Some(Eligibility::Filtered(SECONDARIES)))
            }
            Self::SecondaryPreferred { .. } => {
                (Eligibility::Filtered(SECONDARIES), Some(Eligibility::Primary))
            }
            Self::Nearest { .. } => (Eligibility::Filtered(DATA_BEARING_MEMBERS), None),
        }
    }

    fn mode_name(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    /// The staleness bound, with zero treated as no bound.
    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options()
            .and_then(|options| options.max_staleness)
            .filter(|max_staleness| !max_staleness.is_zero())
    }

    pub(crate) fn tag_sets(&self) -> Option<&[TagSet]> {
        self.options()
            .and_then(|options| options.tag_sets.as_deref())
    }

    /// Returns this read preference restricted to members matching `tag_sets`. Fails for
    /// `Primary`.
    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        self.options_mut("tag sets")?.tag_sets = Some(tag_sets);
        Ok(self)
    }

    /// Returns this read preference restricted to secondaries lagging at most `max_staleness`.
    /// Fails for `Primary`.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        self.options_mut("max staleness")?.max_staleness = Some(max_staleness);
        Ok(self)
    }

    fn options_mut(&mut self, setting: &str) -> Result<&mut ReadPreferenceOptions> {
        match self {
            Self::Primary => Err(Error::invalid_argument(format!(
                "{setting} cannot be used with the primary read preference"
            ))),
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => Ok(options.get_or_insert_with(Default::default)),
        }
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode_name())?;

        let mut settings = Vec::new();
        if let Some(tag_sets) = self.tag_sets() {
            let tag_sets: Vec<_> = tag_sets.iter().map(display_tag_set).collect();
            settings.push(format!("tag sets [{}]", tag_sets.join(", ")));
        }
        if let Some(max_staleness) = self.max_staleness() {
            settings.push(format!("max staleness {}s", max_staleness.as_secs()));
        }

        if !settings.is_empty() {
            write!(f, " ({})", settings.join(", "))?;
        }
        Ok(())
    }
}

fn display_tag_set(tag_set: &TagSet) -> String {
    let mut pairs: Vec<_> = tag_set.iter().map(|(k, v)| format!("{k}: {v}")).collect();
    pairs.sort();
    format!("{{{}}}", pairs.join(", "))
}
