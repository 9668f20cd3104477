use bitcoincore_rpc::bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_ENDIF, OP_IF, OP_PUSHBYTES_0, OP_PUSHBYTES_1, OP_PUSHBYTES_75,
    OP_PUSHDATA1, OP_PUSHDATA2, OP_PUSHDATA4, OP_PUSHNUM_1, OP_PUSHNUM_16, OP_RETURN,
};

/// Any push larger than this needs a PUSHDATA opcode.
pub const MAX_DIRECT_PUSH: usize = 75;
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    Push(&'a [u8]),
    Op(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated {
    pub offset: usize,
}

/// Walks a script without interpreting it. Stops after the first push whose
/// declared length runs past the end of the script.
pub struct Instructions<'a> {
    script: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self {
            script,
            pos: 0,
            done: false,
        }
    }

    fn read_len(&self, at: usize, width: usize) -> Option<usize> {
        let bytes = self.script.get(at..at + width)?;
        let mut buf = [0u8; 4];
        buf[..width].copy_from_slice(bytes);
        Some(u32::from_le_bytes(buf) as usize)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<(usize, Instruction<'a>), Truncated>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.script.len() {
            return None;
        }

        let start = self.pos;
        let opcode = self.script[start];

        let (header, len) = if opcode == OP_PUSHBYTES_0.to_u8() {
            (1, 0)
        } else if (OP_PUSHBYTES_1.to_u8()..=OP_PUSHBYTES_75.to_u8()).contains(&opcode) {
            (1, opcode as usize)
        } else if opcode == OP_PUSHDATA1.to_u8() {
            (2, self.read_len(start + 1, 1).unwrap_or(usize::MAX))
        } else if opcode == OP_PUSHDATA2.to_u8() {
            (3, self.read_len(start + 1, 2).unwrap_or(usize::MAX))
        } else if opcode == OP_PUSHDATA4.to_u8() {
            (5, self.read_len(start + 1, 4).unwrap_or(usize::MAX))
        } else {
            self.pos += 1;
            return Some(Ok((start, Instruction::Op(opcode))));
        };

        let data_start = start + header;
        let Some(data_end) = data_start.checked_add(len).filter(|&e| e <= self.script.len()) else {
            self.done = true;
            return Some(Err(Truncated { offset: start }));
        };

        self.pos = data_end;
        Some(Ok((
            start,
            Instruction::Push(&self.script[data_start..data_end]),
        )))
    }
}

/// Every well-formed push in the script, with the offset of its opcode.
pub fn pushes(script: &[u8]) -> impl Iterator<Item = (usize, &[u8])> {
    Instructions::new(script).map_while(Result::ok).filter_map(|(offset, ins)| match ins {
        Instruction::Push(data) => Some((offset, data)),
        Instruction::Op(_) => None,
    })
}

#[inline]
pub fn is_op_return(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN.to_u8())
}

#[inline]
pub fn is_small_int(opcode: u8) -> bool {
    (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&opcode)
}

#[inline]
pub fn small_int_value(opcode: u8) -> Option<u8> {
    is_small_int(opcode).then(|| opcode - OP_PUSHNUM_1.to_u8() + 1)
}

/// `OP_m <keys...> OP_n OP_CHECKMULTISIG`
pub fn is_bare_multisig(script: &[u8]) -> bool {
    match (script.first(), script.last()) {
        (Some(&first), Some(&last)) => {
            is_small_int(first) && last == OP_CHECKMULTISIG.to_u8() && script.len() > 3
        }
        _ => false,
    }
}

#[inline]
pub fn op_if() -> u8 {
    OP_IF.to_u8()
}

#[inline]
pub fn op_endif() -> u8 {
    OP_ENDIF.to_u8()
}

/// Appends a minimal push of `data` to `script`.
pub fn push_bytes(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len <= MAX_DIRECT_PUSH {
        script.push(len as u8);
    } else if len <= u8::MAX as usize {
        script.push(OP_PUSHDATA1.to_u8());
        script.push(len as u8);
    } else if len <= u16::MAX as usize {
        script.push(OP_PUSHDATA2.to_u8());
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4.to_u8());
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}
