// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// The definition types, in an order where every type only references types
/// before it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DefinitionKind {
    String = 0,
    SystemTreeNode,
    LocationGroup,
    Location,
    SourceFile,
    Region,
    Group,
    InterimCommunicator,
    Communicator,
    RmaWindow,
    Metric,
    Parameter,
    Callpath,
    CartesianTopology,
    IoHandle,
}

impl DefinitionKind {
    pub const COUNT: usize = 15;

    pub const ALL: [DefinitionKind; Self::COUNT] = [
        Self::String,
        Self::SystemTreeNode,
        Self::LocationGroup,
        Self::Location,
        Self::SourceFile,
        Self::Region,
        Self::Group,
        Self::InterimCommunicator,
        Self::Communicator,
        Self::RmaWindow,
        Self::Metric,
        Self::Parameter,
        Self::Callpath,
        Self::CartesianTopology,
        Self::IoHandle,
    ];

    /// The types copied into the unified manager, in copy order. Interim
    /// communicators are resolved to communicators beforehand and never
    /// reach it.
    pub const UNIFY_ORDER: [DefinitionKind; Self::COUNT - 1] = [
        Self::String,
        Self::SystemTreeNode,
        Self::LocationGroup,
        Self::Location,
        Self::SourceFile,
        Self::Region,
        Self::Group,
        Self::Communicator,
        Self::RmaWindow,
        Self::Metric,
        Self::Parameter,
        Self::Callpath,
        Self::CartesianTopology,
        Self::IoHandle,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::String => "String",
            Self::SystemTreeNode => "SystemTreeNode",
            Self::LocationGroup => "LocationGroup",
            Self::Location => "Location",
            Self::SourceFile => "SourceFile",
            Self::Region => "Region",
            Self::Group => "Group",
            Self::InterimCommunicator => "InterimCommunicator",
            Self::Communicator => "Communicator",
            Self::RmaWindow => "RmaWindow",
            Self::Metric => "Metric",
            Self::Parameter => "Parameter",
            Self::Callpath => "Callpath",
            Self::CartesianTopology => "CartesianTopology",
            Self::IoHandle => "IoHandle",
        }
    }

    /// Whether writers need a local to global mapping of this type. Locations
    /// get their own 64 bit mapping.
    pub const fn has_mapping(self) -> bool {
        matches!(
            self,
            Self::String
                | Self::LocationGroup
                | Self::Region
                | Self::Group
                | Self::Communicator
                | Self::RmaWindow
                | Self::Metric
                | Self::Parameter
                | Self::Callpath
                | Self::CartesianTopology
                | Self::IoHandle
        )
    }

    /// Types deduplicated already while recording.
    pub const fn always_hashed(self) -> bool {
        matches!(
            self,
            Self::String | Self::SourceFile | Self::Region | Self::Parameter
        )
    }

    /// Types deduplicated in the unified manager. Two locations never compare
    /// equal, so hashing them is pointless.
    pub const fn hashed_when_unified(self) -> bool {
        !matches!(self, Self::Location | Self::InterimCommunicator)
    }

    /// Types whose communicator reference may still point to an interim
    /// communicator until unification. They must not be hashed before that,
    /// as resolving the reference changes their hash.
    pub const fn references_interim_communicator(self) -> bool {
        matches!(
            self,
            Self::RmaWindow | Self::CartesianTopology | Self::IoHandle
        )
    }
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_agree_with_discriminants() {
        for (index, kind) in DefinitionKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), index);
            assert_eq!(DefinitionKind::from_u8(index as u8), Some(*kind));
        }
        assert_eq!(DefinitionKind::from_u8(DefinitionKind::COUNT as u8), None);
        assert!(DefinitionKind::UNIFY_ORDER.windows(2).all(|w| w[0] < w[1]));
        assert!(!DefinitionKind::UNIFY_ORDER.contains(&DefinitionKind::InterimCommunicator));
    }

    #[test]
    fn hash_policies() {
        for kind in DefinitionKind::ALL {
            assert!(!(kind.always_hashed() && kind.references_interim_communicator()));
            if kind.always_hashed() {
                assert!(kind.hashed_when_unified());
            }
        }
        assert!(!DefinitionKind::Location.has_mapping());
        assert_eq!(DefinitionKind::CartesianTopology.to_string(), "CartesianTopology");
    }
}
