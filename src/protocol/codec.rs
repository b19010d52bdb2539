use crate::cluster::Member;
use crate::consensus::{Position, Term};
use crate::protocol::frame::{templates, DecodeError, MessageHeader, NULL_U64, SCHEMA_ID, SCHEMA_VERSION};
use crate::protocol::messages::{
    AppendRequest, AppendResponse, ConfigureRequest, ConfigureResponse, JoinRequest, LeaveResponse, Message,
    PollRequest, PollResponse, VoteRequest, VoteResponse, WireEntry,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

// Fixed body sizes. The header's block_length declares these on the wire so a newer
// writer can grow the fixed body and an older reader can still skip past it.
const VOTE_REQUEST_BLOCK: u16 = 28;
const VOTE_RESPONSE_BLOCK: u16 = 9;
const POLL_REQUEST_BLOCK: u16 = 28;
const POLL_RESPONSE_BLOCK: u16 = 9;
const APPEND_REQUEST_BLOCK: u16 = 52;
const APPEND_RESPONSE_BLOCK: u16 = 21;
const CONFIGURE_REQUEST_BLOCK: u16 = 26;
const CONFIGURE_RESPONSE_BLOCK: u16 = 8;
const JOIN_REQUEST_BLOCK: u16 = 4;
const LEAVE_RESPONSE_BLOCK: u16 = 25;

/// Encode `message` into `dst`, returning the number of bytes written.
///
/// All declared lengths are computed before their sections are written; encoding is a
/// single forward pass with no backpatching.
pub fn encode(message: &Message, dst: &mut BytesMut) -> usize {
    let start = dst.len();

    match message {
        Message::VoteRequest(m) => {
            MessageHeader::new(VOTE_REQUEST_BLOCK, templates::VOTE_REQUEST).write(dst);
            dst.put_u16_le(m.partition_id);
            dst.put_u64_le(m.term.as_u64());
            put_opt_position(dst, m.last_entry_position);
            put_opt_term(dst, m.last_entry_term);
            dst.put_u16_le(m.candidate.port);
            put_str(dst, &m.candidate.host);
        }
        Message::VoteResponse(m) => {
            MessageHeader::new(VOTE_RESPONSE_BLOCK, templates::VOTE_RESPONSE).write(dst);
            dst.put_u64_le(m.term.as_u64());
            dst.put_u8(m.granted as u8);
        }
        Message::PollRequest(m) => {
            MessageHeader::new(POLL_REQUEST_BLOCK, templates::POLL_REQUEST).write(dst);
            dst.put_u16_le(m.partition_id);
            dst.put_u64_le(m.term.as_u64());
            put_opt_position(dst, m.last_entry_position);
            put_opt_term(dst, m.last_entry_term);
            dst.put_u16_le(m.candidate.port);
            put_str(dst, &m.candidate.host);
            put_str(dst, &m.topic_name);
        }
        Message::PollResponse(m) => {
            MessageHeader::new(POLL_RESPONSE_BLOCK, templates::POLL_RESPONSE).write(dst);
            dst.put_u64_le(m.term.as_u64());
            dst.put_u8(m.granted as u8);
        }
        Message::AppendRequest(m) => {
            MessageHeader::new(APPEND_REQUEST_BLOCK, templates::APPEND_REQUEST).write(dst);
            dst.put_u16_le(m.partition_id);
            dst.put_u64_le(m.term.as_u64());
            put_opt_position(dst, m.previous_entry_position);
            put_opt_term(dst, m.previous_entry_term);
            put_opt_position(dst, m.commit_position);
            match &m.entry {
                Some(entry) => {
                    dst.put_u64_le(entry.position.as_u64());
                    dst.put_u64_le(entry.term.as_u64());
                }
                None => {
                    dst.put_u64_le(NULL_U64);
                    dst.put_u64_le(NULL_U64);
                }
            }
            dst.put_u16_le(m.leader.as_ref().map(|l| l.port).unwrap_or(0));
            put_str(dst, m.leader.as_ref().map(|l| l.host.as_str()).unwrap_or(""));
            put_bytes(dst, m.entry.as_ref().map(|e| e.payload.as_ref()).unwrap_or(&[]));
        }
        Message::AppendResponse(m) => {
            MessageHeader::new(APPEND_RESPONSE_BLOCK, templates::APPEND_RESPONSE).write(dst);
            dst.put_u16_le(m.partition_id);
            dst.put_u64_le(m.term.as_u64());
            dst.put_u8(m.succeeded as u8);
            put_opt_position(dst, m.entry_position);
            dst.put_u16_le(m.member.as_ref().map(|r| r.port).unwrap_or(0));
            put_str(dst, m.member.as_ref().map(|r| r.host.as_str()).unwrap_or(""));
        }
        Message::ConfigureRequest(m) => {
            MessageHeader::new(CONFIGURE_REQUEST_BLOCK, templates::CONFIGURE_REQUEST).write(dst);
            dst.put_u16_le(m.partition_id);
            dst.put_u64_le(m.term.as_u64());
            dst.put_u64_le(m.configuration_entry_position.as_u64());
            dst.put_u64_le(m.configuration_entry_term.as_u64());
            put_str(dst, &m.topic_name);
            put_members(dst, &m.members);
        }
        Message::ConfigureResponse(m) => {
            MessageHeader::new(CONFIGURE_RESPONSE_BLOCK, templates::CONFIGURE_RESPONSE).write(dst);
            dst.put_u64_le(m.term.as_u64());
        }
        Message::JoinRequest(m) => {
            MessageHeader::new(JOIN_REQUEST_BLOCK, templates::JOIN_REQUEST).write(dst);
            dst.put_u16_le(m.partition_id);
            dst.put_u16_le(m.member.port);
            put_str(dst, &m.member.host);
            put_str(dst, &m.topic_name);
        }
        Message::LeaveResponse(m) => {
            MessageHeader::new(LEAVE_RESPONSE_BLOCK, templates::LEAVE_RESPONSE).write(dst);
            dst.put_u64_le(m.term.as_u64());
            dst.put_u8(m.succeeded as u8);
            put_opt_position(dst, m.configuration_entry_position);
            put_opt_term(dst, m.configuration_entry_term);
            put_members(dst, &m.members);
        }
    }

    dst.len() - start
}

/// Decode one message from `src`. The slice must hold exactly one frame: any unread
/// trailing bytes (or a body shorter than declared) fail the whole frame.
pub fn decode(src: &[u8]) -> Result<Message, DecodeError> {
    let mut buf = src;
    let header = MessageHeader::read(&mut buf)?;

    if header.schema_id != SCHEMA_ID {
        return Err(DecodeError::UnknownSchema(header.schema_id));
    }
    if header.version > SCHEMA_VERSION {
        return Err(DecodeError::UnsupportedVersion(header.version));
    }

    let message = match header.template_id {
        templates::VOTE_REQUEST => decode_vote_request(&mut buf, header)?,
        templates::VOTE_RESPONSE => decode_vote_response(&mut buf, header)?,
        templates::POLL_REQUEST => decode_poll_request(&mut buf, header)?,
        templates::POLL_RESPONSE => decode_poll_response(&mut buf, header)?,
        templates::APPEND_REQUEST => decode_append_request(&mut buf, header)?,
        templates::APPEND_RESPONSE => decode_append_response(&mut buf, header)?,
        templates::CONFIGURE_REQUEST => decode_configure_request(&mut buf, header)?,
        templates::CONFIGURE_RESPONSE => decode_configure_response(&mut buf, header)?,
        templates::JOIN_REQUEST => decode_join_request(&mut buf, header)?,
        templates::LEAVE_RESPONSE => decode_leave_response(&mut buf, header)?,
        other => return Err(DecodeError::UnknownTemplate(other)),
    };

    if !buf.is_empty() {
        return Err(DecodeError::FrameLength {
            declared: src.len(),
            consumed: src.len() - buf.len(),
        });
    }

    Ok(message)
}

/// Membership-change entries carry the full member list as their payload. This is the
/// payload codec the engine uses when proposing and applying configuration entries.
pub fn encode_membership(members: &[Member]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + members.len() * 32);
    put_members(&mut buf, members);
    buf.freeze()
}

pub fn decode_membership(payload: &[u8]) -> Result<Vec<Member>, DecodeError> {
    let mut buf = payload;
    let members = get_members(&mut buf)?;
    if !buf.is_empty() {
        return Err(DecodeError::FrameLength {
            declared: payload.len(),
            consumed: payload.len() - buf.len(),
        });
    }
    Ok(members)
}

fn decode_vote_request(buf: &mut &[u8], header: MessageHeader) -> Result<Message, DecodeError> {
    check_block(buf, header, VOTE_REQUEST_BLOCK)?;
    let partition_id = buf.get_u16_le();
    let term = Term::new(buf.get_u64_le());
    let last_entry_position = get_opt_position(buf, "last entry position")?;
    let last_entry_term = get_opt_term(buf);
    let port = buf.get_u16_le();
    skip_block_excess(buf, header, VOTE_REQUEST_BLOCK)?;
    let host = get_str(buf, "candidate host")?;

    Ok(Message::VoteRequest(VoteRequest {
        partition_id,
        term,
        last_entry_position,
        last_entry_term,
        candidate: Member::new(host, port),
    }))
}

fn decode_vote_response(buf: &mut &[u8], header: MessageHeader) -> Result<Message, DecodeError> {
    check_block(buf, header, VOTE_RESPONSE_BLOCK)?;
    let term = Term::new(buf.get_u64_le());
    let granted = buf.get_u8() != 0;
    skip_block_excess(buf, header, VOTE_RESPONSE_BLOCK)?;

    Ok(Message::VoteResponse(VoteResponse { term, granted }))
}

fn decode_poll_request(buf: &mut &[u8], header: MessageHeader) -> Result<Message, DecodeError> {
    check_block(buf, header, POLL_REQUEST_BLOCK)?;
    let partition_id = buf.get_u16_le();
    let term = Term::new(buf.get_u64_le());
    let last_entry_position = get_opt_position(buf, "last entry position")?;
    let last_entry_term = get_opt_term(buf);
    let port = buf.get_u16_le();
    skip_block_excess(buf, header, POLL_REQUEST_BLOCK)?;
    let host = get_str(buf, "candidate host")?;
    let topic_name = get_str(buf, "topic name")?;

    Ok(Message::PollRequest(PollRequest {
        partition_id,
        term,
        last_entry_position,
        last_entry_term,
        candidate: Member::new(host, port),
        topic_name,
    }))
}

fn decode_poll_response(buf: &mut &[u8], header: MessageHeader) -> Result<Message, DecodeError> {
    check_block(buf, header, POLL_RESPONSE_BLOCK)?;
    let term = Term::new(buf.get_u64_le());
    let granted = buf.get_u8() != 0;
    skip_block_excess(buf, header, POLL_RESPONSE_BLOCK)?;

    Ok(Message::PollResponse(PollResponse { term, granted }))
}

fn decode_append_request(buf: &mut &[u8], header: MessageHeader) -> Result<Message, DecodeError> {
    check_block(buf, header, APPEND_REQUEST_BLOCK)?;
    let partition_id = buf.get_u16_le();
    let term = Term::new(buf.get_u64_le());
    let previous_entry_position = get_opt_position(buf, "previous entry position")?;
    let previous_entry_term = get_opt_term(buf);
    let commit_position = get_opt_position(buf, "commit position")?;
    let entry_position = get_opt_position(buf, "entry position")?;
    let entry_term = get_opt_term(buf);
    let leader_port = buf.get_u16_le();
    skip_block_excess(buf, header, APPEND_REQUEST_BLOCK)?;
    let leader_host = get_str(buf, "leader host")?;
    let payload = get_bytes(buf, "entry payload")?;

    // A zero-length host means "no leader endpoint", never an empty hostname.
    let leader = if leader_host.is_empty() {
        None
    } else {
        Some(Member::new(leader_host, leader_port))
    };

    let entry = match (entry_position, entry_term) {
        (Some(position), Some(term)) => Some(WireEntry {
            position,
            term,
            payload,
        }),
        (None, None) => None,
        _ => return Err(DecodeError::InvalidValue("entry position/term")),
    };

    Ok(Message::AppendRequest(AppendRequest {
        partition_id,
        term,
        previous_entry_position,
        previous_entry_term,
        commit_position,
        leader,
        entry,
    }))
}

fn decode_append_response(buf: &mut &[u8], header: MessageHeader) -> Result<Message, DecodeError> {
    check_block(buf, header, APPEND_RESPONSE_BLOCK)?;
    let partition_id = buf.get_u16_le();
    let term = Term::new(buf.get_u64_le());
    let succeeded = buf.get_u8() != 0;
    let entry_position = get_opt_position(buf, "entry position")?;
    let member_port = buf.get_u16_le();
    skip_block_excess(buf, header, APPEND_RESPONSE_BLOCK)?;
    let member_host = get_str(buf, "member host")?;

    let member = if member_host.is_empty() {
        None
    } else {
        Some(Member::new(member_host, member_port))
    };

    Ok(Message::AppendResponse(AppendResponse {
        partition_id,
        term,
        succeeded,
        entry_position,
        member,
    }))
}

fn decode_configure_request(buf: &mut &[u8], header: MessageHeader) -> Result<Message, DecodeError> {
    check_block(buf, header, CONFIGURE_REQUEST_BLOCK)?;
    let partition_id = buf.get_u16_le();
    let term = Term::new(buf.get_u64_le());
    let configuration_entry_position =
        get_opt_position(buf, "configuration entry position")?.ok_or(DecodeError::InvalidValue(
            "configuration entry position",
        ))?;
    let configuration_entry_term = Term::new(buf.get_u64_le());
    skip_block_excess(buf, header, CONFIGURE_REQUEST_BLOCK)?;
    let topic_name = get_str(buf, "topic name")?;
    let members = get_members(buf)?;

    Ok(Message::ConfigureRequest(ConfigureRequest {
        partition_id,
        term,
        configuration_entry_position,
        configuration_entry_term,
        topic_name,
        members,
    }))
}

fn decode_configure_response(buf: &mut &[u8], header: MessageHeader) -> Result<Message, DecodeError> {
    check_block(buf, header, CONFIGURE_RESPONSE_BLOCK)?;
    let term = Term::new(buf.get_u64_le());
    skip_block_excess(buf, header, CONFIGURE_RESPONSE_BLOCK)?;

    Ok(Message::ConfigureResponse(ConfigureResponse { term }))
}

fn decode_join_request(buf: &mut &[u8], header: MessageHeader) -> Result<Message, DecodeError> {
    check_block(buf, header, JOIN_REQUEST_BLOCK)?;
    let partition_id = buf.get_u16_le();
    let port = buf.get_u16_le();
    skip_block_excess(buf, header, JOIN_REQUEST_BLOCK)?;
    let host = get_str(buf, "member host")?;
    let topic_name = get_str(buf, "topic name")?;

    Ok(Message::JoinRequest(JoinRequest {
        partition_id,
        member: Member::new(host, port),
        topic_name,
    }))
}

fn decode_leave_response(buf: &mut &[u8], header: MessageHeader) -> Result<Message, DecodeError> {
    check_block(buf, header, LEAVE_RESPONSE_BLOCK)?;
    let term = Term::new(buf.get_u64_le());
    let succeeded = buf.get_u8() != 0;
    let configuration_entry_position = get_opt_position(buf, "configuration entry position")?;
    let configuration_entry_term = get_opt_term(buf);
    skip_block_excess(buf, header, LEAVE_RESPONSE_BLOCK)?;
    let members = get_members(buf)?;

    Ok(Message::LeaveResponse(LeaveResponse {
        term,
        succeeded,
        configuration_entry_position,
        configuration_entry_term,
        members,
    }))
}

fn check_block(buf: &&[u8], header: MessageHeader, expected: u16) -> Result<(), DecodeError> {
    if header.block_length < expected {
        return Err(DecodeError::Truncated("fixed body"));
    }
    if buf.remaining() < header.block_length as usize {
        return Err(DecodeError::Truncated("fixed body"));
    }
    Ok(())
}

// A newer writer may have grown the fixed body; skip what we don't understand.
fn skip_block_excess(buf: &mut &[u8], header: MessageHeader, expected: u16) -> Result<(), DecodeError> {
    let excess = (header.block_length - expected) as usize;
    if buf.remaining() < excess {
        return Err(DecodeError::Truncated("fixed body"));
    }
    buf.advance(excess);
    Ok(())
}

fn put_opt_position(dst: &mut impl BufMut, position: Option<Position>) {
    dst.put_u64_le(position.map(|p| p.as_u64()).unwrap_or(NULL_U64));
}

fn put_opt_term(dst: &mut impl BufMut, term: Option<Term>) {
    dst.put_u64_le(term.map(|t| t.as_u64()).unwrap_or(NULL_U64));
}

fn get_opt_position(buf: &mut &[u8], field: &'static str) -> Result<Option<Position>, DecodeError> {
    match buf.get_u64_le() {
        NULL_U64 => Ok(None),
        0 => Err(DecodeError::InvalidValue(field)),
        value => Ok(Some(Position::new(value))),
    }
}

fn get_opt_term(buf: &mut &[u8]) -> Option<Term> {
    match buf.get_u64_le() {
        NULL_U64 => None,
        value => Some(Term::new(value)),
    }
}

fn put_str(dst: &mut impl BufMut, value: &str) {
    dst.put_u16_le(value.len() as u16);
    dst.put_slice(value.as_bytes());
}

fn get_str(buf: &mut &[u8], field: &'static str) -> Result<String, DecodeError> {
    let raw = get_bytes(buf, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8(field))
}

fn put_bytes(dst: &mut impl BufMut, value: &[u8]) {
    dst.put_u16_le(value.len() as u16);
    dst.put_slice(value);
}

fn get_bytes(buf: &mut &[u8], field: &'static str) -> Result<Bytes, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError::Truncated(field));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated(field));
    }
    let value = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(value)
}

fn put_members(dst: &mut impl BufMut, members: &[Member]) {
    dst.put_u16_le(members.len() as u16);
    for member in members {
        put_str(dst, &member.host);
        dst.put_u16_le(member.port);
    }
}

fn get_members(buf: &mut &[u8]) -> Result<Vec<Member>, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError::Truncated("member count"));
    }
    let count = buf.get_u16_le() as usize;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        let host = get_str(buf, "member host")?;
        if buf.remaining() < 2 {
            return Err(DecodeError::Truncated("member port"));
        }
        let port = buf.get_u16_le();
        members.push(Member::new(host, port));
    }
    Ok(members)
}
