//! Named semaphores shared between user processes.

use crate::name::FixedName;
use crate::param::MAX_USR_SEM_NAME;
use crate::platform::Platform;
use crate::Kernel;
use core::fmt;
use log::{debug, warn};
use num_enum::IntoPrimitive;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum UsrSemState {
    #[default]
    Free,
    Used,
}

pub struct UsrSemBlock<S> {
    state: UsrSemState,
    name: FixedName<MAX_USR_SEM_NAME>,
    semaphore: Option<S>,
}

impl<S> Default for UsrSemBlock<S> {
    fn default() -> Self {
        Self {
            state: UsrSemState::Free,
            name: FixedName::EMPTY,
            semaphore: None,
        }
    }
}

/// Handle given to user programs. The raw form is the slot index plus one,
/// so 0 stays free to mean "no semaphore".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsrSemHandle(usize);

impl UsrSemHandle {
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        let index = usize::try_from(raw).ok()?.checked_sub(1)?;
        Some(Self(index))
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn into_raw(self) -> u32 {
        (self.0 + 1) as u32
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(i32)]
pub enum UsrSemError {
    /// The handle names no live semaphore
    NotInUse = -1,
    /// Threads are blocked on the semaphore
    Blocked = -2,
}

impl fmt::Display for UsrSemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsrSemError::NotInUse => f.write_str("semaphore not in use"),
            UsrSemError::Blocked => f.write_str("semaphore has blocked threads"),
        }
    }
}

impl<P: Platform> Kernel<P> {
    /// With `value` < 0, look up the semaphore called `name`. Otherwise create
    /// it with `value` as its count, failing if the name is taken.
    pub fn usr_sem_open(&self, name: impl AsRef<[u8]>, value: i32) -> Option<UsrSemHandle> {
        let name = FixedName::<MAX_USR_SEM_NAME>::new(name.as_ref());
        let mut table = self.usr_sem_table.lock(&self.platform);
        let existing = table
            .iter()
            .position(|block| block.state == UsrSemState::Used && block.name == name);

        if value < 0 {
            if existing.is_none() {
                debug!("usr_sem_open({name:?}): no such semaphore");
            }
            return existing.map(UsrSemHandle);
        }
        if existing.is_some() {
            warn!("usr_sem_open({name:?}): name in use");
            return None;
        }

        let Some(index) = table
            .iter()
            .position(|block| block.state == UsrSemState::Free)
        else {
            warn!("usr_sem_open({name:?}): table full");
            return None;
        };
        let semaphore = self.platform.semaphore_create(value)?;
        table[index] = UsrSemBlock {
            state: UsrSemState::Used,
            name,
            semaphore: Some(semaphore),
        };
        Some(UsrSemHandle(index))
    }

    /// The backing semaphore of `handle`, if the handle names a live one
    fn usr_sem_find(&self, handle: UsrSemHandle) -> Result<P::Semaphore, UsrSemError> {
        let table = self.usr_sem_table.lock(&self.platform);
        table
            .get(handle.index())
            .filter(|block| block.state == UsrSemState::Used)
            .and_then(|block| block.semaphore.clone())
            .ok_or(UsrSemError::NotInUse)
    }

    pub fn usr_sem_p(&self, handle: UsrSemHandle) -> Result<(), UsrSemError> {
        let semaphore = self.usr_sem_find(handle)?;
        self.platform.semaphore_p(&semaphore);
        Ok(())
    }

    pub fn usr_sem_v(&self, handle: UsrSemHandle) -> Result<(), UsrSemError> {
        let semaphore = self.usr_sem_find(handle)?;
        self.platform.semaphore_v(&semaphore);
        Ok(())
    }

    /// Destroy the semaphore unless threads are blocked on it.
    ///
    /// A thread that looked the semaphore up before this call and has not yet
    /// blocked on it is not noticed.
    pub fn usr_sem_destroy(&self, handle: UsrSemHandle) -> Result<(), UsrSemError> {
        let semaphore = {
            let mut table = self.usr_sem_table.lock(&self.platform);
            let block = table
                .get_mut(handle.index())
                .filter(|block| block.state == UsrSemState::Used)
                .ok_or(UsrSemError::NotInUse)?;
            if let Some(semaphore) = &block.semaphore {
                if self.platform.semaphore_value(semaphore) < 0 {
                    return Err(UsrSemError::Blocked);
                }
            }
            let semaphore = block.semaphore.take();
            *block = UsrSemBlock::default();
            semaphore
        };
        if let Some(semaphore) = semaphore {
            self.platform.semaphore_destroy(semaphore);
        }
        Ok(())
    }

    /// Number of named semaphores alive
    pub fn usr_sem_count(&self) -> usize {
        self.usr_sem_table
            .lock(&self.platform)
            .iter()
            .filter(|block| block.state == UsrSemState::Used)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_zero_is_null() {
        assert_eq!(UsrSemHandle::from_raw(0), None);
        let handle = UsrSemHandle::from_raw(3).unwrap();
        assert_eq!(handle.index(), 2);
        assert_eq!(handle.into_raw(), 3);
    }
}
