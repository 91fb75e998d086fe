//! Piece and sub-piece selection: rarest-first piece choice, per-sub-piece
//! timeout tracking, and the sticky endgame mode that kicks in once every
//! remaining piece is already in flight somewhere.

use mio::Token;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const SUB_PIECE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubPieceState {
    Missing,
    InFlight,
    Done,
}

#[derive(Debug)]
pub struct PieceState {
    pub hash: [u8; 20],
    /// Number of peers whose bitfield/HAVE set claims this piece.
    pub owners: usize,
    pub verified: bool,
    pub sub_state: Vec<SubPieceState>,
    pub sub_deadline: Vec<Option<Instant>>,
    pub sub_owner: Vec<Option<Token>>,
}

impl PieceState {
    pub fn new(hash: [u8; 20], num_sub_pieces: u32) -> PieceState {
        PieceState {
            hash,
            owners: 0,
            verified: false,
            sub_state: vec![SubPieceState::Missing; num_sub_pieces as usize],
            sub_deadline: vec![None; num_sub_pieces as usize],
            sub_owner: vec![None; num_sub_pieces as usize],
        }
    }

    pub fn is_fully_requested(&self) -> bool {
        self.sub_state.iter().all(|s| *s != SubPieceState::Missing)
    }

    pub fn reset(&mut self) {
        for s in self.sub_state.iter_mut() {
            *s = SubPieceState::Missing;
        }
        self.sub_deadline.iter_mut().for_each(|d| *d = None);
        self.sub_owner.iter_mut().for_each(|o| *o = None);
    }
}

/// Request for a single sub-piece, handed to a `PeerSession` to turn into a
/// wire `REQUEST` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubPieceRequest {
    pub piece: usize,
    pub sub_piece: u32,
    pub begin: u32,
    pub length: u32,
}

pub struct Scheduler {
    pieces: Vec<PieceState>,
    /// 0 = off, 1 = active (every remaining sub-piece already in flight),
    /// 2 = sticky-active (never turns back off once entered).
    end_game: u8,
}

impl Scheduler {
    pub fn new(piece_hashes: &[[u8; 20]], num_sub_pieces: impl Fn(usize) -> u32) -> Scheduler {
        let pieces = piece_hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| PieceState::new(*hash, num_sub_pieces(i)))
            .collect();
        Scheduler { pieces, end_game: 0 }
    }

    pub fn piece(&self, index: usize) -> &PieceState {
        &self.pieces[index]
    }

    pub fn mark_verified(&mut self, index: usize) {
        self.pieces[index].verified = true;
        for s in self.pieces[index].sub_state.iter_mut() {
            *s = SubPieceState::Done;
        }
    }

    pub fn mark_mismatch(&mut self, index: usize) {
        self.pieces[index].reset();
    }

    pub fn record_owner(&mut self, index: usize) {
        if index < self.pieces.len() {
            self.pieces[index].owners += 1;
        }
    }

    pub fn forget_owner(&mut self, index: usize) {
        if index < self.pieces.len() && self.pieces[index].owners > 0 {
            self.pieces[index].owners -= 1;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.verified)
    }

    /// Picks sub-piece requests for a peer that has `has_piece(index)` set,
    /// up to `want` requests, preferring the rarest unverified pieces first
    /// and filling out in-progress pieces before starting new ones.
    pub fn pick(
        &mut self,
        owner: Token,
        want: usize,
        has_piece: impl Fn(usize) -> bool,
        sub_piece_len: impl Fn(usize, u32) -> u32,
    ) -> Vec<SubPieceRequest> {
        if want == 0 {
            return Vec::new();
        }

        let endgame_active = self.end_game > 0 || self.should_enter_endgame();
        if endgame_active {
            self.end_game = 2;
        }

        let mut order: Vec<usize> = (0..self.pieces.len())
            .filter(|&i| !self.pieces[i].verified && has_piece(i))
            .collect();
        order.sort_by_key(|&i| self.pieces[i].owners);

        let mut picks = Vec::new();
        let now = Instant::now();

        for piece_index in order {
            if picks.len() >= want {
                break;
            }
            let num_sub = self.pieces[piece_index].sub_state.len();
            for sub in 0..num_sub {
                if picks.len() >= want {
                    break;
                }
                let state = self.pieces[piece_index].sub_state[sub];
                let eligible = match state {
                    SubPieceState::Missing => true,
                    SubPieceState::InFlight => endgame_active,
                    SubPieceState::Done => false,
                };
                if !eligible {
                    continue;
                }
                self.pieces[piece_index].sub_state[sub] = SubPieceState::InFlight;
                self.pieces[piece_index].sub_deadline[sub] = Some(now + SUB_PIECE_TIMEOUT);
                self.pieces[piece_index].sub_owner[sub] = Some(owner);
                picks.push(SubPieceRequest {
                    piece: piece_index,
                    sub_piece: sub as u32,
                    begin: sub as u32 * crate::metainfo::BLOCK_LEN,
                    length: sub_piece_len(piece_index, sub as u32),
                });
            }
        }

        picks
    }

    fn should_enter_endgame(&self) -> bool {
        self.pieces
            .iter()
            .filter(|p| !p.verified)
            .all(|p| p.sub_state.iter().all(|s| *s != SubPieceState::Missing))
            && self.pieces.iter().any(|p| !p.verified)
    }

    /// Sweeps every in-flight sub-piece and resets any past its deadline
    /// back to `Missing` so another peer can pick it up.
    pub fn sweep_timeouts(&mut self) -> usize {
        let now = Instant::now();
        let mut expired = 0;
        for piece in self.pieces.iter_mut() {
            for sub in 0..piece.sub_state.len() {
                if piece.sub_state[sub] == SubPieceState::InFlight {
                    if let Some(deadline) = piece.sub_deadline[sub] {
                        if now >= deadline {
                            piece.sub_state[sub] = SubPieceState::Missing;
                            piece.sub_deadline[sub] = None;
                            piece.sub_owner[sub] = None;
                            expired += 1;
                        }
                    }
                }
            }
        }
        expired
    }

    /// Releases every sub-piece owned by a peer that disconnected mid-request
    /// so the scheduler doesn't wait out a 10s timeout for nothing.
    pub fn release_peer(&mut self, owner: Token) {
        for piece in self.pieces.iter_mut() {
            for sub in 0..piece.sub_state.len() {
                if piece.sub_owner[sub] == Some(owner) && piece.sub_state[sub] == SubPieceState::InFlight {
                    piece.sub_state[sub] = SubPieceState::Missing;
                    piece.sub_deadline[sub] = None;
                    piece.sub_owner[sub] = None;
                }
            }
        }
    }

    pub fn mark_sub_piece_done(&mut self, piece: usize, sub_piece: u32) {
        let state = &mut self.pieces[piece].sub_state[sub_piece as usize];
        *state = SubPieceState::Done;
    }
}
