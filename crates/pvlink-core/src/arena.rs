//! 带代际校验的对象池。
//!
//! # 教案式说明
//! - **意图 (Why)**：Circuit、Channel、订阅与在途请求都是高频增删的记录，彼此之间只保存
//!   轻量句柄而非指针。句柄携带 `generation`，槽位被回收再复用后，旧句柄解析失败而不会
//!   误指向新对象。
//! - **契约 (What)**：`insert` 在达到容量上限时把值原样退回；`remove` 会使该槽位代际加一，
//!   此后所有旧句柄的 `get`/`remove` 均返回 `None`。
//! - **执行逻辑 (How)**：槽位数组 + 空闲链表；空闲槽保留代际，复用时沿用。
//! - **线上标识**：[`Handle::to_wire`] 把索引低 20 位与代际低 12 位压进一个 `u32`，
//!   用作协议里的 cid/subid/ioid。代际截断意味着同一槽位复用 4096 次后才可能碰撞。

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

const WIRE_INDEX_BITS: u32 = 20;
const WIRE_INDEX_MASK: u32 = (1 << WIRE_INDEX_BITS) - 1;
const WIRE_GENERATION_MASK: u32 = (1 << (32 - WIRE_INDEX_BITS)) - 1;

/// 线上标识可寻址的最大槽位数。
pub const MAX_WIRE_SLOTS: usize = 1 << WIRE_INDEX_BITS;

/// 指向 [`Arena`] 中某个槽位的类型化句柄。
// 手写 Copy/Clone/Eq：derive 会要求 T 也实现这些 trait。
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// 压缩为协议中的 32 位标识。
    pub fn to_wire(self) -> u32 {
        ((self.generation & WIRE_GENERATION_MASK) << WIRE_INDEX_BITS)
            | (self.index & WIRE_INDEX_MASK)
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// 固定上限、按需增长的代际对象池。
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
    limit: usize,
}

impl<T> Arena<T> {
    /// 以容量上限构造；上限会被截断到 [`MAX_WIRE_SLOTS`]。
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
            limit: limit.min(MAX_WIRE_SLOTS),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 插入新值；池满时把值退回给调用方，池状态不变。
    pub fn try_insert(&mut self, value: T) -> Result<Handle<T>, T> {
        if self.len >= self.limit {
            return Err(value);
        }
        let handle = match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let (generation, next_free) = match slot {
                    Slot::Vacant {
                        generation,
                        next_free,
                    } => (*generation, *next_free),
                    Slot::Occupied { .. } => return Err(value),
                };
                *slot = Slot::Occupied { generation, value };
                self.free_head = next_free;
                Handle::new(index, generation)
            }
            None => {
                let Ok(index) = u32::try_from(self.slots.len()) else {
                    return Err(value);
                };
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    value,
                });
                Handle::new(index, 0)
            }
        };
        self.len += 1;
        Ok(handle)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// 移除并返回值；旧句柄自此失效。
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            generation: handle.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, vacant) else {
            return None;
        };
        self.free_head = Some(handle.index);
        self.len -= 1;
        Some(value)
    }

    /// 由线上标识还原句柄；仅当对应槽位仍被同一代际占用时成功。
    pub fn resolve_wire(&self, wire: u32) -> Option<Handle<T>> {
        let index = wire & WIRE_INDEX_MASK;
        let wire_generation = wire >> WIRE_INDEX_BITS;
        match self.slots.get(index as usize)? {
            Slot::Occupied { generation, .. }
                if generation & WIRE_GENERATION_MASK == wire_generation =>
            {
                Some(Handle::new(index, *generation))
            }
            _ => None,
        }
    }

    /// 按槽位顺序遍历存活条目。
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((Handle::new(index as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((Handle::new(index as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }

    /// 清空全部条目；所有旧句柄随代际递增失效。
    pub fn clear(&mut self) {
        let handles = self.handles();
        for handle in handles {
            self.remove(handle);
        }
    }

    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::with_limit(MAX_WIRE_SLOTS)
    }
}

impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len)
            .field("limit", &self.limit)
            .finish()
    }
}
