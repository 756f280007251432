use crate::error::Result;
use crate::peer::ice::IceCandidateQueue;
use crate::peer::sdp::SdpPreferences;
use crate::peer::transport::PeerTransport;
use crate::peer::types::{IceCandidate, SessionDescription, SignalingState};
use crate::signaling::{SignalMessage, SignalPayload, SignalingTransport};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    Answered(SessionDescription),
    /// Коллизия, и чужой offer проигрывает нашему
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Queued,
    /// Кандидат к проигнорированному offer'у
    Ignored,
}

/// Обмен offer/answer по схеме perfect negotiation.
/// При коллизии уступает участник с меньшим id: он откатывает свой offer и отвечает.
pub struct SessionNegotiator {
    local_id: String,
    transport: Arc<dyn PeerTransport>,
    signaling: Arc<dyn SignalingTransport>,
    preferences: SdpPreferences,
    candidates: IceCandidateQueue,
    making_offer: bool,
    ignore_offer: bool,
    negotiated: bool,
}

impl SessionNegotiator {
    pub fn new(
        local_id: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn SignalingTransport>,
        preferences: SdpPreferences,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            transport,
            signaling,
            preferences,
            candidates: IceCandidateQueue::new(),
            making_offer: false,
            ignore_offer: false,
            negotiated: false,
        }
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn ignore_offer(&self) -> bool {
        self.ignore_offer
    }

    /// Было ли на этом транспорте хоть одно применённое описание
    pub fn has_negotiated(&self) -> bool {
        self.negotiated
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Вежливая сторона уступает при коллизии
    pub fn is_polite_towards(&self, remote_id: &str) -> bool {
        self.local_id.as_str() < remote_id
    }

    /// Отправляет сигнал. Ошибка канала только логируется.
    pub async fn send(&self, payload: SignalPayload) -> bool {
        let kind = payload.kind();
        match self
            .signaling
            .send(SignalMessage::new(self.local_id.clone(), payload))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping outgoing {kind}: {e}");
                false
            }
        }
    }

    pub async fn announce_ready(&self) -> bool {
        info!("Announcing ready as {}", self.local_id);
        self.send(SignalPayload::Ready).await
    }

    fn for_wire(&self, desc: &SessionDescription) -> SessionDescription {
        SessionDescription {
            sdp_type: desc.sdp_type,
            sdp: self.preferences.apply(&desc.sdp),
        }
    }

    /// Создаёт и отправляет offer. `None`, если согласование уже идёт.
    pub async fn create_offer(&mut self, ice_restart: bool) -> Result<Option<SessionDescription>> {
        let state = self.transport.signaling_state();
        if self.making_offer || state != SignalingState::Stable {
            debug!("Skipping offer: making_offer={} state={state:?}", self.making_offer);
            return Ok(None);
        }

        self.making_offer = true;
        let result = self.make_offer(ice_restart).await;
        self.making_offer = false;
        result.map(Some)
    }

    /// Offer с ICE restart. Неотвеченный собственный offer откатывается,
    /// чтобы каждая попытка восстановления действительно перезапускала ICE.
    /// `None` только пока мы отвечаем на чужой offer.
    pub async fn restart_ice(&mut self) -> Result<Option<SessionDescription>> {
        let state = self.transport.signaling_state();
        if self.making_offer
            || matches!(state, SignalingState::HaveRemoteOffer | SignalingState::Closed)
        {
            debug!("Skipping ICE restart: making_offer={} state={state:?}", self.making_offer);
            return Ok(None);
        }
        if state == SignalingState::HaveLocalOffer {
            info!("Rolling back unanswered offer before ICE restart");
            self.transport.rollback().await?;
        }

        self.making_offer = true;
        let result = self.make_offer(true).await;
        self.making_offer = false;
        result.map(Some)
    }

    async fn make_offer(&mut self, ice_restart: bool) -> Result<SessionDescription> {
        let offer = self.transport.create_offer(ice_restart).await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.negotiated = true;
        info!("Sending offer (ice_restart={ice_restart})");
        self.send(SignalPayload::Offer(self.for_wire(&offer))).await;
        Ok(offer)
    }

    pub async fn handle_incoming_offer(
        &mut self,
        offer: SessionDescription,
        from: &str,
    ) -> Result<OfferOutcome> {
        let state = self.transport.signaling_state();
        let collision = self.making_offer || state != SignalingState::Stable;
        self.ignore_offer = collision && !self.is_polite_towards(from);
        if self.ignore_offer {
            info!("Offer collision with {from}: keeping our offer, ignoring theirs");
            return Ok(OfferOutcome::Ignored);
        }

        if collision && state == SignalingState::HaveLocalOffer {
            info!("Offer collision with {from}: rolling back our offer");
            self.transport.rollback().await?;
        }

        self.transport.set_remote_description(offer).await?;
        self.negotiated = true;
        self.candidates.flush(self.transport.as_ref()).await;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        info!("Sending answer to {from}");
        self.send(SignalPayload::Answer(self.for_wire(&answer))).await;
        Ok(OfferOutcome::Answered(answer))
    }

    /// false, если ответ не ждали (дубликат или устаревший)
    pub async fn handle_incoming_answer(&mut self, answer: SessionDescription) -> Result<bool> {
        let state = self.transport.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            debug!("Ignoring answer: no local offer outstanding (state={state:?})");
            return Ok(false);
        }
        self.transport.set_remote_description(answer).await?;
        self.negotiated = true;
        self.candidates.flush(self.transport.as_ref()).await;
        info!("Remote answer applied");
        Ok(true)
    }

    pub async fn handle_incoming_candidate(&mut self, candidate: IceCandidate) -> Result<CandidateOutcome> {
        if !self.transport.has_remote_description().await {
            self.candidates.push(candidate);
            return Ok(CandidateOutcome::Queued);
        }
        match self.transport.add_ice_candidate(candidate).await {
            Ok(()) => Ok(CandidateOutcome::Applied),
            Err(e) if self.ignore_offer => {
                debug!("Candidate for ignored offer rejected: {e}");
                Ok(CandidateOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    /// Закрывает транспорт и забывает отложенные кандидаты
    pub async fn close(&mut self) {
        self.candidates.clear();
        if let Err(e) = self.transport.close().await {
            debug!("Transport close failed: {e}");
        }
    }
}
