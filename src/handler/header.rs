//! Pass header encoding
//!
//! The copy kernel reads one header buffer per pass, laid out as 32-bit
//! words:
//!
//! ```text
//! elementCount[N] | dwordSizeAndDirection[N] (i32, < 0 = download) | indexOffset[N] | indices...
//! ```
//!
//! [`HeaderView`] and [`redirect`] decode the same layout for the host
//! emulation of the kernel.

/// One request's contribution to a pass header
#[derive(Debug, Clone, Copy)]
pub struct HeaderEntry<'a> {
    pub indices: &'a [u32],
    /// Bytes per element, a multiple of 4
    pub property_size: u32,
    pub download: bool,
}

impl HeaderEntry<'_> {
    pub fn dwords(&self) -> u32 {
        self.property_size / 4
    }

    /// Words moved for this entry, one kernel invocation each
    pub fn invocations(&self) -> u32 {
        self.indices.len() as u32 * self.dwords()
    }
}

/// Reusable header word buffer
#[derive(Debug, Clone, Default)]
pub struct PassHeader {
    words: Vec<u32>,
    property_count: u32,
    max_invocations: u32,
}

impl PassHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the header for one pass, reusing the word buffer
    pub fn encode<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = HeaderEntry<'a>>,
        I::IntoIter: Clone,
    {
        let entries = entries.into_iter();
        let n = entries.clone().count();

        self.words.clear();
        self.property_count = n as u32;
        self.max_invocations = 0;

        self.words.extend(entries.clone().map(|e| e.indices.len() as u32));
        self.words.extend(entries.clone().map(|e| {
            let dwords = e.dwords() as i32;
            (if e.download { -dwords } else { dwords }) as u32
        }));

        let mut offset = 0u32;
        for entry in entries.clone() {
            self.words.push(offset);
            offset += entry.indices.len() as u32;
            self.max_invocations = self.max_invocations.max(entry.invocations());
        }

        self.words.reserve(offset as usize);
        for entry in entries {
            self.words.extend_from_slice(entry.indices);
        }
    }

    pub fn property_count(&self) -> u32 {
        self.property_count
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn byte_size(&self) -> u32 {
        (self.words.len() * 4) as u32
    }

    /// Largest per-property invocation count in the pass
    pub fn max_invocations(&self) -> u32 {
        self.max_invocations
    }

    /// Workgroups along X for `workgroup_size` invocations per group
    pub fn workgroups(&self, workgroup_size: u32) -> u32 {
        self.max_invocations.div_ceil(workgroup_size)
    }

    pub fn view(&self) -> HeaderView<'_> {
        HeaderView::new(&self.words, self.property_count)
    }
}

/// Read-only decoding of header words
#[derive(Debug, Clone, Copy)]
pub struct HeaderView<'a> {
    words: &'a [u32],
    property_count: u32,
}

impl<'a> HeaderView<'a> {
    pub fn new(words: &'a [u32], property_count: u32) -> Self {
        Self { words, property_count }
    }

    pub fn property_count(&self) -> u32 {
        self.property_count
    }

    pub fn element_count(&self, prop: u32) -> Option<u32> {
        self.word(prop)
    }

    /// Element size in words and whether the property is downloaded
    pub fn dwords(&self, prop: u32) -> Option<(u32, bool)> {
        let flag = self.word(self.property_count + prop)? as i32;
        Some((flag.unsigned_abs(), flag < 0))
    }

    pub fn index_offset(&self, prop: u32) -> Option<u32> {
        self.word(2 * self.property_count + prop)
    }

    /// `i`-th entry of the concatenated index table
    pub fn index(&self, i: u32) -> Option<u32> {
        self.word((3 * self.property_count).checked_add(i)?)
    }

    fn word(&self, i: u32) -> Option<u32> {
        self.words.get(i as usize).copied()
    }
}

/// Pool-side word index for invocation `g` of an element at `index` within
/// its request, whose pool slot is `slot`.
///
/// Equivalent to `slot * dwords + g % dwords`.
#[inline]
pub fn redirect(slot: u32, index: u32, dwords: u32, g: u32) -> u32 {
    slot.wrapping_sub(index).wrapping_mul(dwords).wrapping_add(g)
}
