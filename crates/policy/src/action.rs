//! The creative action space.
//!
//! Each dimension is its own enum so an [`Action`] can only ever hold values
//! the bandit knows how to score. Labels are the strings stored in the policy
//! tables and handed to the content generator.

use std::fmt;
use std::str::FromStr;

use postloop_core::PostloopError;
use serde::{Deserialize, Serialize};

/// One independently chosen creative attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Dimension {
    HookType,
    Length,
    Tone,
    Creativity,
    TextInImage,
    VisualStyle,
}

impl Dimension {
    pub const ALL: [Dimension; 6] = [
        Dimension::HookType,
        Dimension::Length,
        Dimension::Tone,
        Dimension::Creativity,
        Dimension::TextInImage,
        Dimension::VisualStyle,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::HookType => "HOOK_TYPE",
            Dimension::Length => "LENGTH",
            Dimension::Tone => "TONE",
            Dimension::Creativity => "CREATIVITY",
            Dimension::TextInImage => "TEXT_IN_IMAGE",
            Dimension::VisualStyle => "VISUAL_STYLE",
        }
    }

    /// Candidate labels in declaration order.
    pub fn labels(self) -> Vec<&'static str> {
        fn collect<V: ActionValue>() -> Vec<&'static str> {
            V::ALL.iter().map(|v| v.label()).collect()
        }
        match self {
            Dimension::HookType => collect::<HookType>(),
            Dimension::Length => collect::<Length>(),
            Dimension::Tone => collect::<Tone>(),
            Dimension::Creativity => collect::<Creativity>(),
            Dimension::TextInImage => collect::<TextInImage>(),
            Dimension::VisualStyle => collect::<VisualStyle>(),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = PostloopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dimension::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| PostloopError::DataIntegrity(format!("unknown dimension '{s}'")))
    }
}

/// A finite value set belonging to exactly one [`Dimension`].
pub trait ActionValue: Copy + Sized + 'static {
    const DIMENSION: Dimension;
    const ALL: &'static [Self];

    fn label(self) -> &'static str;

    fn from_label(label: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.label() == label)
    }
}

macro_rules! action_value {
    ($(#[$meta:meta])* $name:ident, $dim:expr, { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $label)]
                $variant,
            )+
        }

        impl ActionValue for $name {
            const DIMENSION: Dimension = $dim;
            const ALL: &'static [Self] = &[$($name::$variant),+];

            fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }

        impl FromStr for $name {
            type Err = PostloopError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                <$name as ActionValue>::from_label(s).ok_or_else(|| {
                    PostloopError::DataIntegrity(format!(
                        "'{s}' is not a valid {} value",
                        $dim.as_str()
                    ))
                })
            }
        }
    };
}

action_value!(
    /// How the caption opens.
    HookType, Dimension::HookType, {
        Question => "question hook",
        BoldClaim => "bold claim hook",
        RelatablePain => "relatable pain hook",
        TrendyTopic => "trendy topic hook",
        CuriosityGap => "curiosity gap hook",
    }
);

action_value!(Length, Dimension::Length, {
    Short => "short",
    Medium => "medium",
});

action_value!(Tone, Dimension::Tone, {
    Casual => "casual",
    Formal => "formal",
    Humourous => "humourous",
    Educational => "educational",
});

action_value!(Creativity, Dimension::Creativity, {
    Safe => "safe",
    Balanced => "balanced",
    Experimental => "experimental",
});

action_value!(TextInImage, Dimension::TextInImage, {
    TextInImage => "text in image",
    NoTextInImage => "no text in image",
});

action_value!(
    /// Dominant subject of the generated image.
    VisualStyle, Dimension::VisualStyle, {
        Abstract => "abstract",
        HumanFigure => "human figure",
    }
);

/// One chosen value per dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub hook_type: HookType,
    pub length: Length,
    pub tone: Tone,
    pub creativity: Creativity,
    pub text_in_image: TextInImage,
    pub visual_style: VisualStyle,
}

impl Action {
    /// `(dimension, label)` for every field, in [`Dimension::ALL`] order.
    pub fn pairs(&self) -> [(Dimension, &'static str); 6] {
        [
            (Dimension::HookType, self.hook_type.label()),
            (Dimension::Length, self.length.label()),
            (Dimension::Tone, self.tone.label()),
            (Dimension::Creativity, self.creativity.label()),
            (Dimension::TextInImage, self.text_in_image.label()),
            (Dimension::VisualStyle, self.visual_style.label()),
        ]
    }
}
