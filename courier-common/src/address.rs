use std::{
    fmt::{self, Display},
    ops::{Deref, DerefMut},
    str::FromStr,
};

use mailparse::MailAddr;
use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// A single mailbox, split into the parts an SMTP envelope needs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    display_name: Option<String>,
    local_part: String,
    domain: String,
}

impl Address {
    /// Parse one mailbox, with or without a display name
    /// (`alice@example.com` or `"Alice" <alice@example.com>`).
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] for empty input, groups, lists of more than one
    /// mailbox, or a mailbox missing its local part or domain.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let mut list = mailparse::addrparse(trimmed).map_err(|err| AddressError::Unparseable {
            input: trimmed.to_string(),
            reason: err.to_string(),
        })?;

        if list.len() != 1 {
            return Err(AddressError::Multiple(trimmed.to_string()));
        }

        let MailAddr::Single(info) = list.remove(0) else {
            return Err(AddressError::Group(trimmed.to_string()));
        };

        let Some((local, domain)) = info.addr.rsplit_once('@') else {
            return Err(AddressError::InvalidDomain(trimmed.to_string()));
        };

        if local.is_empty() {
            return Err(AddressError::MissingLocalPart(trimmed.to_string()));
        }

        if domain.is_empty()
            || domain.chars().any(char::is_whitespace)
            || domain.split('.').any(str::is_empty)
        {
            return Err(AddressError::InvalidDomain(trimmed.to_string()));
        }

        Ok(Self {
            display_name: info.display_name.filter(|name| !name.is_empty()),
            local_part: local.to_string(),
            domain: domain.to_ascii_lowercase(),
        })
    }

    #[inline]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    #[inline]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[inline]
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Header form of the mailbox, including the display name when there is one
    pub fn mailbox(&self) -> String {
        match &self.display_name {
            Some(name) => format!("\"{}\" <{self}>", name.replace('"', "\\\"")),
            None => self.to_string(),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressList(pub Vec<Address>);

impl AddressList {
    /// Parse every entry, stopping at the first one that is not a valid mailbox.
    ///
    /// # Errors
    ///
    /// Returns the [`AddressError`] of the first invalid entry.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, AddressError> {
        entries
            .iter()
            .map(|entry| Address::parse(entry.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl Display for AddressList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, addr) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            Display::fmt(addr, f)?;
        }
        Ok(())
    }
}

impl From<Vec<Address>> for AddressList {
    fn from(value: Vec<Address>) -> Self {
        Self(value)
    }
}

impl FromIterator<Address> for AddressList {
    fn from_iter<T: IntoIterator<Item = Address>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Deref for AddressList {
    type Target = Vec<Address>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for AddressList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
